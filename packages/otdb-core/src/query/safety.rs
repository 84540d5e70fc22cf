use serde_json::{json, Map, Value};

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::query::registry::{classify, OperatorClass};

/// Field holding the type discriminator; `null` on tombstones.
pub const TYPE_FIELD: &str = "_type";

/// Raw query split into its filter and its execution operators.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedQuery {
    pub query: Map<String, Value>,
    pub collection_operation: Option<(String, Value)>,
    pub cursor_transforms: Map<String, Value>,
    pub cursor_operation: Option<(String, Value)>,
}

/// Reject disallowed operators and conflicting operator combinations.
pub fn check_query(query: &Map<String, Value>, config: &QueryConfig) -> Result<(), QueryError> {
    if query.contains_key("$query") {
        return Err(QueryError::QueryDeprecated);
    }

    check_operator_combinations(query)?;

    if !config.allow_js_queries {
        if query.get("$where").is_some_and(|v| !v.is_null()) {
            return Err(QueryError::WhereDisabled);
        }
        if query.get("$mapReduce").is_some_and(|v| !v.is_null()) {
            return Err(QueryError::MapReduceDisabled);
        }
    }

    if !config.allow_aggregate_queries && query.get("$aggregate").is_some_and(truthy) {
        return Err(QueryError::AggregateDisabled);
    }

    Ok(())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

// At most one collection operation, at most one cursor operation, and no cursor method at all
// once a collection operation is present.
fn check_operator_combinations(query: &Map<String, Value>) -> Result<(), QueryError> {
    let mut collection_operation: Option<&str> = None;
    let mut cursor_operation: Option<&str> = None;
    let mut found_cursor_method = false;

    for key in query.keys().filter(|k| k.starts_with('$')) {
        match classify(key) {
            Some(OperatorClass::CollectionOperation) => {
                if let Some(first) = collection_operation {
                    return Err(QueryError::OnlyOneCollectionOperation(
                        first.to_string(),
                        key.clone(),
                    ));
                }
                collection_operation = Some(key);
            }
            Some(OperatorClass::CursorOperation) => {
                if let Some(first) = cursor_operation {
                    return Err(QueryError::OnlyOneCursorOperation(first.to_string(), key.clone()));
                }
                cursor_operation = Some(key);
                found_cursor_method = true;
            }
            Some(OperatorClass::CursorTransform) => found_cursor_method = true,
            None => {}
        }
    }

    match collection_operation {
        Some(op) if found_cursor_method => Err(QueryError::CursorAndCollectionMethod(op.to_string())),
        _ => Ok(()),
    }
}

/// Split execution operators out of the filter. Expects a query that passed [`check_query`].
pub fn parse_query(input: &Map<String, Value>) -> ParsedQuery {
    let mut parsed = ParsedQuery::default();
    for (key, value) in input {
        match classify(key) {
            Some(OperatorClass::CollectionOperation) => {
                parsed.collection_operation = Some((key.clone(), value.clone()));
            }
            Some(OperatorClass::CursorTransform) => {
                parsed.cursor_transforms.insert(key.clone(), value.clone());
            }
            Some(OperatorClass::CursorOperation) => {
                parsed.cursor_operation = Some((key.clone(), value.clone()));
            }
            None => {
                parsed.query.insert(key.clone(), value.clone());
            }
        }
    }
    parsed
}

/// Constrain the filter so it cannot match tombstones.
///
/// Tombstones keep their row (so a recreated document continues its version) but have an empty
/// payload and a null `_type`. Unless the caller already constrains `_type`, a query that could
/// match such a row gets `_type: {$type: 2}` added. Returns whether the query was changed.
pub fn make_query_safe(query: &mut Map<String, Value>) -> bool {
    if query.contains_key(TYPE_FIELD) {
        return false;
    }
    if could_match_tombstone(query) {
        query.insert(TYPE_FIELD.into(), json!({ "$type": 2 }));
        return true;
    }
    false
}

/// Whether a document with every payload field absent could satisfy `query`.
///
/// Conservative: `true` unless some top-level clause provably rejects null/absent values, and
/// always `true` when an operator we don't understand appears at the top level.
pub fn could_match_tombstone(query: &Map<String, Value>) -> bool {
    let mut excluded = false;
    for (key, clause) in query {
        if is_retained_on_tombstone(key) {
            continue;
        }
        let clause_excludes = match key.as_str() {
            "$and" => match clause.as_array() {
                Some(branches) => branches.iter().any(|b| !branch_could_match(b)),
                None => false,
            },
            "$or" => match clause.as_array() {
                Some(branches) if !branches.is_empty() => {
                    branches.iter().all(|b| !branch_could_match(b))
                }
                _ => false,
            },
            k if k.starts_with('$') => return true,
            _ => !could_match_null(clause),
        };
        excluded |= clause_excludes;
    }
    !excluded
}

fn branch_could_match(branch: &Value) -> bool {
    match branch {
        Value::Object(map) => could_match_tombstone(map),
        _ => true,
    }
}

// Fields that keep their values when a document is deleted.
fn is_retained_on_tombstone(key: &str) -> bool {
    matches!(key, "_id" | "_v" | "_o" | "_m") || key.starts_with("_m.")
}

/// Whether a field clause could be satisfied by a null or missing value.
pub fn could_match_null(clause: &Value) -> bool {
    match clause {
        Value::Number(_) | Value::Bool(_) | Value::String(_) => false,
        Value::Null => true,
        Value::Object(parts) => {
            // Multiple operators are an implicit AND: one part rejecting null is enough.
            for (op, value) in parts {
                let part_rejects_null = match op.as_str() {
                    "$in" => value
                        .as_array()
                        .is_some_and(|items| !items.iter().any(Value::is_null)),
                    "$ne" => value.is_null(),
                    "$exists" => truthy(value),
                    "$gt" | "$gte" | "$lt" | "$lte" => !value.is_null(),
                    _ => false,
                };
                if part_rejects_null {
                    return false;
                }
            }
            true
        }
        Value::Array(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn literal_clause_excludes_tombstones() {
        assert!(!could_match_tombstone(&obj(json!({"name": "bob"}))));
        assert!(could_match_tombstone(&obj(json!({"name": null}))));
        assert!(could_match_tombstone(&obj(json!({}))));
    }

    #[test]
    fn operator_clauses() {
        assert!(!could_match_tombstone(&obj(json!({"x": {"$ne": null}}))));
        assert!(!could_match_tombstone(&obj(json!({"x": {"$exists": true}}))));
        assert!(could_match_tombstone(&obj(json!({"x": {"$exists": false}}))));
        assert!(!could_match_tombstone(&obj(json!({"x": {"$in": [1, 2]}}))));
        assert!(could_match_tombstone(&obj(json!({"x": {"$in": [1, null]}}))));
        assert!(!could_match_tombstone(&obj(json!({"x": {"$gte": 3, "$lt": null}}))));
        assert!(could_match_tombstone(&obj(json!({"x": {"$ne": 3}}))));
    }

    #[test]
    fn boolean_composition() {
        assert!(!could_match_tombstone(&obj(json!({"$and": [{"x": null}, {"y": 1}]}))));
        assert!(could_match_tombstone(&obj(json!({"$and": [{"x": null}, {"y": null}]}))));
        assert!(!could_match_tombstone(&obj(json!({"$or": [{"x": 1}, {"y": 2}]}))));
        assert!(could_match_tombstone(&obj(json!({"$or": [{"x": 1}, {"y": null}]}))));
        assert!(could_match_tombstone(&obj(json!({"$or": "nope"}))));
    }

    #[test]
    fn unknown_top_level_operator_is_assumed_to_match() {
        assert!(could_match_tombstone(&obj(json!({"name": "bob", "$where": "1"}))));
    }

    #[test]
    fn retained_fields_do_not_exclude() {
        assert!(could_match_tombstone(&obj(json!({"_id": "a", "_v": 3, "_m.ctime": 1}))));
    }

    #[test]
    fn explicit_type_constraint_is_left_alone() {
        let mut query = obj(json!({"_type": null}));
        assert!(!make_query_safe(&mut query));
        assert_eq!(Value::Object(query), json!({"_type": null}));
    }
}
