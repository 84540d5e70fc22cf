//! Mongo-style query handling: operator validation, tombstone safety, and translation into a
//! storage-independent [`QueryPlan`].

pub mod eval;
pub mod plan;
pub mod registry;
pub mod safety;

use serde_json::Value;

use crate::config::QueryConfig;
use crate::error::QueryError;

pub use eval::{cmp_snapshots, distinct_values, field_value, matches};
pub use plan::{
    plan_query, translate_filter, Aggregation, CmpOp, Field, JsonKind, Predicate, QueryPlan,
    SortKey,
};
pub use registry::{classify, OperatorClass, OperatorRegistry};
pub use safety::{
    check_query, could_match_null, could_match_tombstone, make_query_safe, parse_query,
    ParsedQuery, TYPE_FIELD,
};

/// Validate, make tombstone-safe, and translate a raw query. Performs no I/O.
pub fn prepare_query(raw: &Value, config: &QueryConfig) -> Result<QueryPlan, QueryError> {
    let Value::Object(input) = raw else {
        return Err(QueryError::Unsupported("query must be an object".into()));
    };
    check_query(input, config)?;
    let mut parsed = parse_query(input);
    make_query_safe(&mut parsed.query);
    plan_query(&parsed)
}
