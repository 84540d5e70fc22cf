//! Rendering of a [`QueryPlan`] into parameterized SQL over the `snapshots` table.
//!
//! Every leaf is wrapped in `COALESCE(.., FALSE)` so SQL's three-valued logic collapses to the
//! same two-valued result the in-memory evaluator produces, including under `NOT`.

use postgres::types::ToSql;
use serde_json::{Map, Value};

use otdb_core::query::{Aggregation, CmpOp, Field, JsonKind, Predicate, QueryPlan, SortKey};
use otdb_core::QueryError;

pub(crate) type SqlParam = Box<dyn ToSql + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StatementKind {
    Rows,
    Count,
    Distinct,
}

pub(crate) struct QueryStatement {
    pub kind: StatementKind,
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl QueryStatement {
    pub fn param_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect()
    }
}

pub(crate) const SNAPSHOT_COLUMNS: &str = "doc_id, doc_type, version, data, metadata";

struct SqlBuilder {
    params: Vec<SqlParam>,
}

impl SqlBuilder {
    fn new(collection: &str) -> Self {
        let mut builder = Self { params: Vec::new() };
        builder.bind(collection.to_string());
        builder
    }

    fn bind<T: ToSql + Sync + 'static>(&mut self, value: T) -> String {
        self.params.push(Box::new(value));
        format!("${}", self.params.len())
    }

    fn bind_path(&mut self, path: &[String]) -> String {
        let p = self.bind(path.to_vec());
        format!("data #> {p}::text[]")
    }

    fn predicate(&mut self, predicate: &Predicate) -> Result<String, QueryError> {
        Ok(match predicate {
            Predicate::True => "TRUE".into(),
            Predicate::And(parts) => self.junction(parts, " AND ", "TRUE")?,
            Predicate::Or(parts) => self.junction(parts, " OR ", "FALSE")?,
            Predicate::Not(inner) => format!("NOT ({})", self.predicate(inner)?),
            leaf => format!("COALESCE({}, FALSE)", self.leaf(leaf)?),
        })
    }

    fn junction(
        &mut self,
        parts: &[Predicate],
        separator: &str,
        empty: &str,
    ) -> Result<String, QueryError> {
        if parts.is_empty() {
            return Ok(empty.into());
        }
        let rendered = parts
            .iter()
            .map(|p| self.predicate(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", rendered.join(separator)))
    }

    fn leaf(&mut self, predicate: &Predicate) -> Result<String, QueryError> {
        match predicate {
            Predicate::Eq(field, value) => self.equality(field, value),
            Predicate::Cmp(field, op, bound) => self.comparison(field, *op, bound),
            Predicate::Exists(field, expected) => Ok(self.exists(field, *expected)),
            Predicate::TypeIs(field, kind) => Ok(self.type_is(field, *kind)),
            _ => self.predicate(predicate),
        }
    }

    fn equality(&mut self, field: &Field, value: &Value) -> Result<String, QueryError> {
        match (field, value) {
            (Field::Id, Value::String(s)) => Ok(format!("doc_id = {}", self.bind(s.clone()))),
            (Field::Version, Value::Number(n)) => match n.as_u64().map(i64::try_from) {
                Some(Ok(v)) => Ok(format!("version = {}", self.bind(v))),
                Some(Err(_)) => Ok("FALSE".into()),
                None => Err(unsupported(field, value)),
            },
            (Field::Type, Value::Null) => Ok("doc_type IS NULL".into()),
            (Field::Type, Value::String(s)) => Ok(format!("doc_type = {}", self.bind(s.clone()))),
            (Field::Data(path), Value::Null) => {
                let p = self.bind(path.clone());
                Ok(format!(
                    "(data #> {p}::text[] IS NULL OR data #> {p}::text[] = 'null'::jsonb)"
                ))
            }
            (Field::Data(path), value) => {
                let doc = self.bind(nest(path, value.clone()));
                Ok(format!("data @> {doc}::jsonb"))
            }
            _ => Err(unsupported(field, value)),
        }
    }

    fn comparison(&mut self, field: &Field, op: CmpOp, bound: &Value) -> Result<String, QueryError> {
        let op_sql = op.sql();
        match (field, bound) {
            (Field::Version, Value::Number(n)) => match n.as_u64().map(i64::try_from) {
                Some(Ok(v)) => Ok(format!("version {op_sql} {}", self.bind(v))),
                // Stored versions never exceed i64::MAX.
                Some(Err(_)) => Ok(match op {
                    CmpOp::Lt | CmpOp::Lte => "TRUE".into(),
                    CmpOp::Gt | CmpOp::Gte => "FALSE".into(),
                }),
                None => Err(unsupported(field, bound)),
            },
            (Field::Id, Value::String(s)) => {
                Ok(format!("doc_id COLLATE \"C\" {op_sql} {}", self.bind(s.clone())))
            }
            (Field::Type, Value::String(s)) => {
                Ok(format!("doc_type COLLATE \"C\" {op_sql} {}", self.bind(s.clone())))
            }
            (Field::Data(path), Value::Number(_)) => {
                let p = self.bind(path.clone());
                let v = self.bind(bound.clone());
                Ok(format!(
                    "(jsonb_typeof(data #> {p}::text[]) = 'number' AND data #> {p}::text[] {op_sql} {v}::jsonb)"
                ))
            }
            (Field::Data(path), Value::String(s)) => {
                let p = self.bind(path.clone());
                let v = self.bind(s.clone());
                Ok(format!(
                    "(jsonb_typeof(data #> {p}::text[]) = 'string' AND (data #>> {p}::text[]) COLLATE \"C\" {op_sql} {v})"
                ))
            }
            _ => Err(unsupported(field, bound)),
        }
    }

    fn exists(&mut self, field: &Field, expected: bool) -> String {
        let null_check = if expected { "IS NOT NULL" } else { "IS NULL" };
        match field {
            Field::Id | Field::Version => if expected { "TRUE" } else { "FALSE" }.into(),
            Field::Type => format!("doc_type {null_check}"),
            Field::Data(path) => format!("{} {null_check}", self.bind_path(path)),
        }
    }

    fn type_is(&mut self, field: &Field, kind: JsonKind) -> String {
        let constant = |matches: bool| if matches { "TRUE" } else { "FALSE" }.to_string();
        match field {
            Field::Id => constant(kind == JsonKind::String),
            Field::Version => constant(kind == JsonKind::Number),
            Field::Type if kind == JsonKind::String => "doc_type IS NOT NULL".into(),
            Field::Type => constant(false),
            Field::Data(path) => {
                let expr = self.bind_path(path);
                let k = self.bind(kind.json_type_name().to_string());
                format!("jsonb_typeof({expr}) = {k}")
            }
        }
    }

    // Expression a field sorts or deduplicates on.
    fn field_expr(&mut self, field: &Field, for_sort: bool) -> String {
        match (field, for_sort) {
            (Field::Id, true) => "doc_id COLLATE \"C\"".into(),
            (Field::Type, true) => "doc_type COLLATE \"C\"".into(),
            (Field::Version, true) => "version".into(),
            (Field::Id, false) => "to_jsonb(doc_id)".into(),
            (Field::Type, false) => "to_jsonb(doc_type)".into(),
            (Field::Version, false) => "to_jsonb(version)".into(),
            (Field::Data(path), _) => self.bind_path(path),
        }
    }

    // Payload values sort by JSON kind, then strings bytewise, then jsonb order within a kind,
    // so the database collation never decides between two strings.
    fn sort_exprs(&mut self, field: &Field) -> Vec<String> {
        let Field::Data(path) = field else {
            return vec![self.field_expr(field, true)];
        };
        let p = self.bind(path.to_vec());
        let value = format!("data #> {p}::text[]");
        vec![
            format!(
                "CASE jsonb_typeof({value}) WHEN 'null' THEN 0 WHEN 'string' THEN 1 \
                 WHEN 'number' THEN 2 WHEN 'boolean' THEN 3 WHEN 'array' THEN 4 \
                 WHEN 'object' THEN 5 END"
            ),
            format!(
                "(CASE WHEN jsonb_typeof({value}) = 'string' THEN data #>> {p}::text[] END) \
                 COLLATE \"C\""
            ),
            value,
        ]
    }

    fn order_by(&mut self, keys: &[SortKey]) -> String {
        let mut terms: Vec<String> = Vec::new();
        for key in keys {
            let direction = if key.descending {
                "DESC NULLS FIRST"
            } else {
                "ASC NULLS LAST"
            };
            for expr in self.sort_exprs(&key.field) {
                terms.push(format!("{expr} {direction}"));
            }
        }
        terms.push("doc_id COLLATE \"C\" ASC".into());
        terms.join(", ")
    }
}

fn unsupported(field: &Field, value: &Value) -> QueryError {
    QueryError::Unsupported(format!("{field:?} compared with {value}"))
}

// {"a": {"b": value}} for path ["a", "b"].
fn nest(path: &[String], value: Value) -> Value {
    path.iter().rev().fold(value, |inner, key| {
        let mut map = Map::new();
        map.insert(key.clone(), inner);
        Value::Object(map)
    })
}

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Render `plan` as a single statement over `collection`. Fails only for predicates the plan
/// validator would already have rejected.
pub(crate) fn render_query(collection: &str, plan: &QueryPlan) -> Result<QueryStatement, QueryError> {
    let mut b = SqlBuilder::new(collection);
    let filter = b.predicate(&plan.predicate)?;
    let scope = format!("FROM snapshots WHERE collection = $1 AND {filter}");

    let (kind, sql) = match &plan.aggregation {
        Some(Aggregation::Count) => (StatementKind::Count, format!("SELECT COUNT(*) {scope}")),
        Some(Aggregation::Distinct(field)) => {
            let expr = b.field_expr(field, false);
            (
                StatementKind::Distinct,
                format!("SELECT DISTINCT {expr} AS value {scope} AND {expr} IS NOT NULL"),
            )
        }
        None => {
            let mut sql = format!(
                "SELECT {SNAPSHOT_COLUMNS} {scope} ORDER BY {}",
                b.order_by(&plan.sort)
            );
            if let Some(limit) = plan.limit {
                sql.push_str(&format!(" LIMIT {}", b.bind(clamp_i64(limit))));
            }
            if let Some(skip) = plan.skip {
                sql.push_str(&format!(" OFFSET {}", b.bind(clamp_i64(skip))));
            }
            (StatementKind::Rows, sql)
        }
    };

    Ok(QueryStatement {
        kind,
        sql,
        params: b.params,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use otdb_core::{prepare_query, QueryConfig};

    use super::*;

    fn render(query: Value) -> QueryStatement {
        let plan = prepare_query(&query, &QueryConfig::default()).unwrap();
        render_query("docs", &plan).unwrap()
    }

    #[test]
    fn or_of_literals_uses_containment() {
        let stmt = render(json!({"$or": [{"name": "bob"}, {"name": "alice"}]}));
        assert_eq!(stmt.kind, StatementKind::Rows);
        assert_eq!(
            stmt.sql,
            "SELECT doc_id, doc_type, version, data, metadata FROM snapshots \
             WHERE collection = $1 AND (COALESCE(data @> $2::jsonb, FALSE) OR COALESCE(data @> $3::jsonb, FALSE)) \
             ORDER BY doc_id COLLATE \"C\" ASC"
        );
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn empty_query_requires_live_documents() {
        let stmt = render(json!({}));
        assert!(
            stmt.sql.contains("WHERE collection = $1 AND COALESCE(doc_type IS NOT NULL, FALSE)"),
            "{}",
            stmt.sql
        );
    }

    #[test]
    fn negation_wraps_coalesced_leaf() {
        let stmt = render(json!({"x": {"$ne": 3}, "y": 1}));
        assert!(stmt.sql.contains("NOT (COALESCE(data @> $2::jsonb, FALSE))"), "{}", stmt.sql);
    }

    #[test]
    fn sort_limit_offset() {
        let stmt = render(json!({"k": 1, "$sort": {"rank": -1}, "$limit": 5, "$skip": 10}));
        assert!(
            stmt.sql.ends_with(
                "COLLATE \"C\" DESC NULLS FIRST, data #> $3::text[] DESC NULLS FIRST, \
                 doc_id COLLATE \"C\" ASC LIMIT $4 OFFSET $5"
            ),
            "{}",
            stmt.sql
        );
        assert_eq!(stmt.params.len(), 5);
    }

    #[test]
    fn payload_sort_orders_strings_bytewise() {
        let stmt = render(json!({"$sort": {"name": 1}}));
        let order = stmt.sql.split(" ORDER BY ").nth(1).unwrap();
        assert_eq!(
            order,
            "CASE jsonb_typeof(data #> $2::text[]) WHEN 'null' THEN 0 WHEN 'string' THEN 1 \
             WHEN 'number' THEN 2 WHEN 'boolean' THEN 3 WHEN 'array' THEN 4 \
             WHEN 'object' THEN 5 END ASC NULLS LAST, \
             (CASE WHEN jsonb_typeof(data #> $2::text[]) = 'string' THEN data #>> $2::text[] END) \
             COLLATE \"C\" ASC NULLS LAST, \
             data #> $2::text[] ASC NULLS LAST, \
             doc_id COLLATE \"C\" ASC"
        );
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn count_and_distinct_statements() {
        let count = render(json!({"k": 1, "$count": true}));
        assert_eq!(count.kind, StatementKind::Count);
        assert!(count.sql.starts_with("SELECT COUNT(*) FROM snapshots"));

        let distinct = render(json!({"k": 1, "$distinct": {"field": "owner"}}));
        assert_eq!(distinct.kind, StatementKind::Distinct);
        assert!(distinct
            .sql
            .starts_with("SELECT DISTINCT data #> $3::text[] AS value FROM snapshots"));
        assert!(distinct.sql.ends_with("AND data #> $3::text[] IS NOT NULL"));
    }

    #[test]
    fn comparisons_check_json_kind() {
        let stmt = render(json!({"n": {"$gt": 2}}));
        assert!(stmt.sql.contains("jsonb_typeof(data #> $2::text[]) = 'number'"), "{}", stmt.sql);
        let stmt = render(json!({"s": {"$lt": "m"}}));
        assert!(stmt.sql.contains("COLLATE \"C\" < $3"), "{}", stmt.sql);
    }

    #[test]
    fn nested_path_containment_document() {
        assert_eq!(
            nest(&["a".into(), "b".into()], json!(1)),
            json!({"a": {"b": 1}})
        );
    }

    #[test]
    fn non_integer_version_is_rejected() {
        let plan = QueryPlan {
            predicate: Predicate::Eq(Field::Version, json!(1.5)),
            sort: Vec::new(),
            skip: None,
            limit: None,
            aggregation: None,
        };
        assert_eq!(render_query("docs", &plan).err().map(|e| e.code()), Some(4111));
    }
}
