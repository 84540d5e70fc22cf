use std::collections::HashMap;

use serde_json::Value;

use crate::cache::cached_version;
use crate::error::Result;
use crate::types::{
    CommitOptions, Operation, Projection, QueryResult, ReadOptions, Snapshot, Version,
};

/// Persistence contract the OT server drives.
///
/// Implementations must serialize concurrent commits to the same document themselves; callers
/// never hold a lock across calls. Every method other than `close` fails with
/// [`crate::Error::AlreadyClosed`] once the instance is closed.
pub trait OtDb: Send + Sync {
    /// Persist `op` and `snapshot` iff `snapshot.v` is the next version of the document.
    ///
    /// `Ok(false)` means another writer got there first; the caller should fetch, transform and
    /// retry. Storage failures are errors.
    fn commit(
        &self,
        collection: &str,
        id: &str,
        op: &Operation,
        snapshot: &Snapshot,
        options: &CommitOptions,
    ) -> Result<bool>;

    /// Current snapshot, or a version-0 placeholder when the document was never created.
    fn get_snapshot(
        &self,
        collection: &str,
        id: &str,
        fields: Option<&Projection>,
        options: &ReadOptions,
    ) -> Result<Snapshot>;

    /// Snapshots for every id in `ids`. Unknown ids map to version-0 placeholders.
    fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: &[String],
        fields: Option<&Projection>,
        options: &ReadOptions,
    ) -> Result<HashMap<String, Snapshot>>;

    /// Ops with `from <= version < to` (or `version >= from` when `to` is `None`), ascending.
    fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: Version,
        to: Option<Version>,
        options: &ReadOptions,
    ) -> Result<Vec<Operation>>;

    /// Run a Mongo-style query against the current snapshots of `collection`.
    fn query(
        &self,
        collection: &str,
        query: &Value,
        fields: Option<&Projection>,
        options: &ReadOptions,
    ) -> Result<QueryResult>;

    /// Release pooled resources. Idempotent.
    fn close(&self);
}

/// Key/value cache engine holding serialized snapshots.
///
/// Errors are advisory: the cache layer logs and discards them.
pub trait SnapshotCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: String) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    /// Store `value` (a snapshot at `version`) unless the entry already holds `version` or a
    /// later one. Returns whether the entry was written.
    ///
    /// The default reads then writes; engines that can compare-and-set atomically should
    /// override it.
    fn set_if_newer(&self, key: &str, version: Version, value: String) -> Result<bool> {
        let current = self.get(key)?;
        if current.as_deref().and_then(cached_version).is_some_and(|v| v >= version) {
            return Ok(false);
        }
        self.set(key, value)?;
        Ok(true)
    }
}
