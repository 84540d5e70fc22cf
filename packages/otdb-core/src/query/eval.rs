use std::borrow::Cow;
use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crate::query::plan::{CmpOp, Field, JsonKind, Predicate, SortKey};
use crate::types::Snapshot;

/// Value of `field` on `snapshot`, or `None` when absent.
pub fn field_value<'a>(snapshot: &'a Snapshot, field: &Field) -> Option<Cow<'a, Value>> {
    match field {
        Field::Id => Some(Cow::Owned(Value::String(snapshot.id.clone()))),
        Field::Version => Some(Cow::Owned(Value::Number(Number::from(snapshot.v)))),
        Field::Type => snapshot
            .doc_type
            .as_ref()
            .map(|t| Cow::Owned(Value::String(t.clone()))),
        Field::Data(path) => {
            let mut cur = snapshot.data.as_ref()?;
            for segment in path {
                cur = cur.as_object()?.get(segment)?;
            }
            Some(Cow::Borrowed(cur))
        }
    }
}

/// In-memory evaluation of a [`Predicate`], matching what the SQL rendering selects.
pub fn matches(snapshot: &Snapshot, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::True => true,
        Predicate::And(parts) => parts.iter().all(|p| matches(snapshot, p)),
        Predicate::Or(parts) => parts.iter().any(|p| matches(snapshot, p)),
        Predicate::Not(inner) => !matches(snapshot, inner),
        Predicate::Eq(field, expected) => {
            let actual = field_value(snapshot, field);
            match (actual.as_deref(), expected) {
                (None, Value::Null) | (Some(Value::Null), Value::Null) => true,
                (None, _) | (_, Value::Null) => false,
                (Some(actual), expected) => match field {
                    Field::Data(_) => json_contains(actual, expected),
                    _ => json_eq(actual, expected),
                },
            }
        }
        Predicate::Cmp(field, op, bound) => {
            let Some(actual) = field_value(snapshot, field) else {
                return false;
            };
            let ord = match (actual.as_ref(), bound) {
                (Value::Number(a), Value::Number(b)) => cmp_numbers(a, b),
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => return false,
            };
            match op {
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Gte => ord != Ordering::Less,
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Lte => ord != Ordering::Greater,
            }
        }
        Predicate::Exists(field, expected) => field_value(snapshot, field).is_some() == *expected,
        Predicate::TypeIs(field, kind) => {
            field_value(snapshot, field).is_some_and(|v| JsonKind::of(&v) == *kind)
        }
    }
}

fn cmp_numbers(a: &Number, b: &Number) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        _ => Ordering::Equal,
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => cmp_numbers(a, b) == Ordering::Equal,
        _ => a == b,
    }
}

// Containment below the top level of a document, as PostgreSQL's `@>` defines it.
fn json_contains(container: &Value, contained: &Value) -> bool {
    match (container, contained) {
        (Value::Object(outer), Value::Object(inner)) => inner
            .iter()
            .all(|(k, v)| outer.get(k).is_some_and(|o| json_contains(o, v))),
        (Value::Array(outer), Value::Array(inner)) => inner
            .iter()
            .all(|v| outer.iter().any(|o| json_contains(o, v))),
        _ => json_eq(container, contained),
    }
}

fn kind_rank(value: &Value) -> u8 {
    // jsonb btree order: null < string < number < boolean < array < object
    match value {
        Value::Null => 0,
        Value::String(_) => 1,
        Value::Number(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

pub fn cmp_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x.len().cmp(&y.len()).then_with(|| {
            x.iter()
                .zip(y)
                .map(|(a, b)| cmp_json(a, b))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }),
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()).then_with(|| {
            storage_order(x)
                .into_iter()
                .zip(storage_order(y))
                .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| cmp_json(va, vb)))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

// jsonb stores object keys shorter first, then bytewise.
fn storage_order(map: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    entries
}

// Absent values sort after present ones ascending (and first descending), like SQL NULLs.
fn cmp_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp_json(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Order by `keys`, then by document id.
pub fn cmp_snapshots(a: &Snapshot, b: &Snapshot, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let va = field_value(a, &key.field);
        let vb = field_value(b, &key.field);
        let ord = cmp_optional(va.as_deref(), vb.as_deref());
        let ord = if key.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.as_bytes().cmp(b.id.as_bytes())
}

/// Distinct present values of `field`, sorted.
pub fn distinct_values<'a, I>(snapshots: I, field: &Field) -> Vec<Value>
where
    I: IntoIterator<Item = &'a Snapshot>,
{
    let mut values: Vec<Value> = Vec::new();
    for snapshot in snapshots {
        let Some(value) = field_value(snapshot, field) else {
            continue;
        };
        if !values.iter().any(|v| json_eq(v, &value)) {
            values.push(value.into_owned());
        }
    }
    values.sort_by(cmp_json);
    values
}
