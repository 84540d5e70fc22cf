use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Document version. `0` means the document has never been created.
pub type Version = u64;

/// Materialized state of a document at `v`.
///
/// `doc_type == None` marks a document that was deleted (tombstone) or never created. Tombstones
/// keep their version so a recreated document continues the same op log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub v: Version,
    #[serde(rename = "type")]
    pub doc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Value>,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, v: Version, doc_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            v,
            doc_type: Some(doc_type.into()),
            data: Some(data),
            m: None,
        }
    }

    /// Placeholder for a document with no stored row.
    pub fn missing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            v: 0,
            doc_type: None,
            data: None,
            m: None,
        }
    }

    pub fn tombstone(id: impl Into<String>, v: Version) -> Self {
        Self {
            id: id.into(),
            v,
            doc_type: None,
            data: None,
            m: None,
        }
    }

    pub fn with_meta(mut self, m: Value) -> Self {
        self.m = Some(m);
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.doc_type.is_none()
    }

    /// Shape the snapshot for a reader: drop metadata unless requested and apply the projection.
    pub fn present(mut self, fields: Option<&Projection>, options: &ReadOptions) -> Self {
        if !options.metadata {
            self.m = None;
        }
        if let Some(fields) = fields {
            fields.apply(&mut self);
        }
        self
    }

    /// Reject snapshots that cannot be committed under `id`.
    pub fn check_commit(&self, id: &str) -> Result<()> {
        if self.id != id {
            return Err(Error::InvalidOperation(format!(
                "snapshot id {:?} does not match document id {:?}",
                self.id, id
            )));
        }
        if self.doc_type.is_none() && self.data.is_some() {
            return Err(Error::InvalidOperation(
                "tombstone snapshot must not carry data".into(),
            ));
        }
        Ok(())
    }
}

/// An edit as submitted by the OT layer.
///
/// The body (`create`, `op`, `del`, ...) is opaque to storage and round-trips unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<Value>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Operation {
    pub fn create(doc_type: &str, data: Value) -> Self {
        let mut create = Map::new();
        create.insert("type".into(), Value::String(doc_type.into()));
        create.insert("data".into(), data);
        Self::with_body("create", Value::Object(create))
    }

    pub fn edit(op: Value) -> Self {
        Self::with_body("op", op)
    }

    pub fn delete() -> Self {
        Self::with_body("del", Value::Bool(true))
    }

    fn with_body(key: &str, value: Value) -> Self {
        let mut body = Map::new();
        body.insert(key.into(), value);
        Self {
            body,
            ..Self::default()
        }
    }

    pub fn from_source(mut self, src: impl Into<String>, seq: u64) -> Self {
        self.src = Some(src.into());
        self.seq = Some(seq);
        self
    }

    pub fn at_version(mut self, v: Version) -> Self {
        self.v = Some(v);
        self
    }

    pub fn is_create(&self) -> bool {
        self.body.contains_key("create")
    }

    pub fn is_delete(&self) -> bool {
        self.body.contains_key("del")
    }
}

/// Per-commit options passed through by the OT server. Carries no settings yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CommitOptions {}

/// Top-level payload fields a reader asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Projection {
    fields: Vec<String>,
}

impl Projection {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse `{field: true | 1, ...}`. Falsy entries are ignored.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::InvalidOperation("fields must be an object".into()));
        };
        let fields = map
            .iter()
            .filter(|(_, v)| match v {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
                _ => false,
            })
            .map(|(k, _)| k.clone())
            .collect();
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn apply(&self, snapshot: &mut Snapshot) {
        if let Some(Value::Object(data)) = snapshot.data.as_mut() {
            data.retain(|k, _| self.fields.iter().any(|f| f == k));
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Include snapshot metadata (`m`) in results.
    pub metadata: bool,
}

impl ReadOptions {
    pub fn with_metadata() -> Self {
        Self { metadata: true }
    }
}

/// Matches of a query, plus the result of a `$count` / `$distinct` when one was requested.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub snapshots: Vec<Snapshot>,
    pub extra: Option<Value>,
}
