use serde_json::{Map, Value};
use tracing::warn;

use crate::error::QueryError;
use crate::query::safety::ParsedQuery;

/// A queryable attribute of a stored snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    /// `_id`
    Id,
    /// `_v`
    Version,
    /// `_type`; null on tombstones.
    Type,
    /// Path into the payload, split on `.`.
    Data(Vec<String>),
}

impl Field {
    fn parse(key: &str) -> Result<Self, QueryError> {
        match key {
            "_id" => Ok(Field::Id),
            "_v" => Ok(Field::Version),
            "_type" => Ok(Field::Type),
            "_o" | "_m" => Err(QueryError::Unsupported(format!("field {key}"))),
            k if k.starts_with("_m.") => Err(QueryError::Unsupported(format!("field {key}"))),
            k => {
                let path: Vec<String> = k.split('.').map(str::to_string).collect();
                if path.iter().any(|p| p.is_empty()) {
                    return Err(QueryError::Unsupported(format!("field path {k:?}")));
                }
                Ok(Field::Data(path))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    pub fn sql(self) -> &'static str {
        match self {
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
        }
    }
}

/// JSON value kinds addressable through `$type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsonKind {
    Number,
    String,
    Object,
    Array,
    Bool,
    Null,
}

impl JsonKind {
    // Accepts BSON type numbers and aliases for the kinds JSON can represent.
    fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_u64()? {
                1 | 16 | 18 | 19 => Some(JsonKind::Number),
                2 => Some(JsonKind::String),
                3 => Some(JsonKind::Object),
                4 => Some(JsonKind::Array),
                8 => Some(JsonKind::Bool),
                10 => Some(JsonKind::Null),
                _ => None,
            },
            Value::String(s) => match s.as_str() {
                "double" | "int" | "long" | "decimal" | "number" => Some(JsonKind::Number),
                "string" => Some(JsonKind::String),
                "object" => Some(JsonKind::Object),
                "array" => Some(JsonKind::Array),
                "bool" => Some(JsonKind::Bool),
                "null" => Some(JsonKind::Null),
                _ => None,
            },
            _ => None,
        }
    }

    /// Name as reported by `jsonb_typeof`.
    pub fn json_type_name(self) -> &'static str {
        match self {
            JsonKind::Number => "number",
            JsonKind::String => "string",
            JsonKind::Object => "object",
            JsonKind::Array => "array",
            JsonKind::Bool => "boolean",
            JsonKind::Null => "null",
        }
    }

    pub fn of(value: &Value) -> Self {
        match value {
            Value::Number(_) => JsonKind::Number,
            Value::String(_) => JsonKind::String,
            Value::Object(_) => JsonKind::Object,
            Value::Array(_) => JsonKind::Array,
            Value::Bool(_) => JsonKind::Bool,
            Value::Null => JsonKind::Null,
        }
    }
}

/// Storage-independent filter over snapshots.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    True,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Equality. On payload fields this is JSON containment; `null` matches null or absent.
    Eq(Field, Value),
    /// Ordered comparison against a number or string; only same-kind values match.
    Cmp(Field, CmpOp, Value),
    Exists(Field, bool),
    TypeIs(Field, JsonKind),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SortKey {
    pub field: Field,
    pub descending: bool,
}

/// Result-shaping operation that replaces the document list.
#[derive(Clone, Debug, PartialEq)]
pub enum Aggregation {
    Count,
    Distinct(Field),
}

/// Fully validated query, ready for a backend to execute.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    pub predicate: Predicate,
    pub sort: Vec<SortKey>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub aggregation: Option<Aggregation>,
}

// Transforms that only tune how a cursor is fetched and have no effect on results here.
const ADVISORY_TRANSFORMS: &[&str] = &[
    "$batchSize",
    "$comment",
    "$hint",
    "$maxTimeMS",
    "$noCursorTimeout",
    "$readConcern",
    "$readPref",
    "$snapshot",
];

pub fn plan_query(parsed: &ParsedQuery) -> Result<QueryPlan, QueryError> {
    let predicate = translate_filter(&parsed.query)?;

    let mut plan = QueryPlan {
        predicate,
        sort: Vec::new(),
        skip: None,
        limit: None,
        aggregation: None,
    };

    for (key, value) in &parsed.cursor_transforms {
        match key.as_str() {
            "$sort" => plan.sort = translate_sort(key, value)?,
            "$orderby" => {
                warn!("Deprecated: $orderby; Use $sort.");
                plan.sort = translate_sort(key, value)?;
            }
            "$skip" => plan.skip = Some(non_negative(key, value)?),
            "$limit" => plan.limit = Some(non_negative(key, value)?),
            k if ADVISORY_TRANSFORMS.contains(&k) => {}
            k => return Err(QueryError::Unsupported(format!("cursor transform {k}"))),
        }
    }

    if let Some((key, _)) = &parsed.cursor_operation {
        match key.as_str() {
            "$count" => plan.aggregation = Some(Aggregation::Count),
            k => return Err(QueryError::Unsupported(format!("cursor operation {k}"))),
        }
    }

    if let Some((key, value)) = &parsed.collection_operation {
        match key.as_str() {
            "$distinct" => {
                let field = value
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| QueryError::MalformedOperator(key.clone()))?;
                plan.aggregation = Some(Aggregation::Distinct(Field::parse(field)?));
            }
            k => return Err(QueryError::Unsupported(format!("collection operation {k}"))),
        }
    }

    Ok(plan)
}

fn non_negative(key: &str, value: &Value) -> Result<u64, QueryError> {
    value
        .as_u64()
        .ok_or_else(|| QueryError::MalformedOperator(key.to_string()))
}

fn translate_sort(key: &str, value: &Value) -> Result<Vec<SortKey>, QueryError> {
    let Value::Object(spec) = value else {
        return Err(QueryError::MalformedOperator(key.to_string()));
    };
    spec.iter()
        .map(|(field, direction)| {
            let descending = match direction.as_i64() {
                Some(1) => false,
                Some(-1) => true,
                _ => return Err(QueryError::MalformedOperator(key.to_string())),
            };
            Ok(SortKey {
                field: Field::parse(field)?,
                descending,
            })
        })
        .collect()
}

/// Translate a (safe) filter document into a [`Predicate`]. Top-level clauses are ANDed.
pub fn translate_filter(query: &Map<String, Value>) -> Result<Predicate, QueryError> {
    let mut clauses = Vec::with_capacity(query.len());
    for (key, value) in query {
        let clause = match key.as_str() {
            "$and" => Predicate::And(translate_branches(key, value)?),
            "$or" => Predicate::Or(translate_branches(key, value)?),
            "$nor" => Predicate::Not(Box::new(Predicate::Or(translate_branches(key, value)?))),
            k if k.starts_with('$') => {
                return Err(QueryError::Unsupported(format!("query operator {k}")))
            }
            k => translate_clause(Field::parse(k)?, value)?,
        };
        clauses.push(clause);
    }
    Ok(match clauses.len() {
        0 => Predicate::True,
        1 => clauses.remove(0),
        _ => Predicate::And(clauses),
    })
}

fn translate_branches(key: &str, value: &Value) -> Result<Vec<Predicate>, QueryError> {
    let branches = value
        .as_array()
        .ok_or_else(|| QueryError::MalformedOperator(key.to_string()))?;
    branches
        .iter()
        .map(|branch| match branch {
            Value::Object(map) => translate_filter(map),
            _ => Err(QueryError::MalformedOperator(key.to_string())),
        })
        .collect()
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn translate_clause(field: Field, value: &Value) -> Result<Predicate, QueryError> {
    let ops = match value {
        Value::Object(ops) if is_operator_object(value) => ops,
        _ => return equality(field, value.clone()),
    };

    let mut parts = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let part = match op.as_str() {
            "$eq" => equality(field.clone(), operand.clone())?,
            "$ne" => Predicate::Not(Box::new(equality(field.clone(), operand.clone())?)),
            "$gt" => comparison(&field, CmpOp::Gt, op, operand)?,
            "$gte" => comparison(&field, CmpOp::Gte, op, operand)?,
            "$lt" => comparison(&field, CmpOp::Lt, op, operand)?,
            "$lte" => comparison(&field, CmpOp::Lte, op, operand)?,
            "$in" => membership(&field, op, operand)?,
            "$nin" => Predicate::Not(Box::new(membership(&field, op, operand)?)),
            "$exists" => match operand {
                Value::Bool(b) => Predicate::Exists(field.clone(), *b),
                _ => return Err(QueryError::MalformedOperator(op.clone())),
            },
            "$type" => match JsonKind::parse(operand) {
                Some(kind) => Predicate::TypeIs(field.clone(), kind),
                None => return Err(QueryError::Unsupported(format!("$type {operand}"))),
            },
            other => return Err(QueryError::Unsupported(format!("field operator {other}"))),
        };
        parts.push(part);
    }
    Ok(match parts.len() {
        1 => parts.remove(0),
        _ => Predicate::And(parts),
    })
}

fn equality(field: Field, value: Value) -> Result<Predicate, QueryError> {
    let ok = match (&field, &value) {
        (Field::Id, Value::String(_)) => true,
        (Field::Version, Value::Number(n)) => n.as_u64().is_some(),
        (Field::Type, Value::String(_) | Value::Null) => true,
        (Field::Data(_), _) => true,
        _ => false,
    };
    if !ok {
        return Err(QueryError::Unsupported(format!(
            "{} compared with {value}",
            field_name(&field)
        )));
    }
    Ok(Predicate::Eq(field, value))
}

fn comparison(field: &Field, op: CmpOp, key: &str, bound: &Value) -> Result<Predicate, QueryError> {
    let ok = match (field, bound) {
        (Field::Version, Value::Number(n)) => n.as_u64().is_some(),
        (Field::Id | Field::Type, Value::String(_)) => true,
        (Field::Data(_), Value::Number(_) | Value::String(_)) => true,
        _ => false,
    };
    if !ok {
        return Err(QueryError::Unsupported(format!("{key} bound {bound}")));
    }
    Ok(Predicate::Cmp(field.clone(), op, bound.clone()))
}

fn membership(field: &Field, key: &str, values: &Value) -> Result<Predicate, QueryError> {
    let values = values
        .as_array()
        .ok_or_else(|| QueryError::MalformedOperator(key.to_string()))?;
    let branches = values
        .iter()
        .map(|v| equality(field.clone(), v.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Predicate::Or(branches))
}

fn field_name(field: &Field) -> String {
    match field {
        Field::Id => "_id".into(),
        Field::Version => "_v".into(),
        Field::Type => "_type".into(),
        Field::Data(path) => path.join("."),
    }
}
