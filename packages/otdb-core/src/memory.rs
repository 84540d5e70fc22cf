use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::CacheLayer;
use crate::config::QueryConfig;
use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::query::{self, Aggregation};
use crate::traits::{OtDb, SnapshotCache};
use crate::types::{
    CommitOptions, Operation, Projection, QueryResult, ReadOptions, Snapshot, Version,
};

type DocKey = (String, String);

fn doc_key(collection: &str, id: &str) -> DocKey {
    (collection.to_string(), id.to_string())
}

#[derive(Default)]
struct MemoryState {
    snapshots: BTreeMap<DocKey, Snapshot>,
    // ops[i] has version i + 1
    ops: HashMap<DocKey, Vec<Operation>>,
}

/// In-process backend with the same commit and query semantics as the durable ones.
pub struct MemoryDb {
    state: Mutex<MemoryState>,
    cache: CacheLayer,
    query_config: QueryConfig,
    lifecycle: Lifecycle,
    durable_reads: AtomicU64,
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDb {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            cache: CacheLayer::disabled(),
            query_config: QueryConfig::default(),
            lifecycle: Lifecycle::new(),
            durable_reads: AtomicU64::new(0),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        self.cache = CacheLayer::new(cache);
        self
    }

    pub fn with_query_config(mut self, config: QueryConfig) -> Self {
        self.query_config = config;
        self
    }

    /// Number of snapshot reads that reached the backing map (cache misses).
    pub fn durable_reads(&self) -> u64 {
        self.durable_reads.load(Ordering::Relaxed)
    }

    pub fn invalidate_cached(&self, collection: &str, id: &str) {
        self.cache.invalidate(collection, id);
    }

    /// Overwrite a stored snapshot without going through `commit`, leaving the op log and the
    /// cache untouched. Test hook for modelling writers that bypass this instance.
    #[doc(hidden)]
    pub fn put_snapshot_unchecked(&self, collection: &str, snapshot: Snapshot) {
        let key = doc_key(collection, &snapshot.id);
        self.state.lock().snapshots.insert(key, snapshot);
    }

    fn load_snapshot(&self, collection: &str, id: &str) -> Option<Snapshot> {
        self.durable_reads.fetch_add(1, Ordering::Relaxed);
        self.state.lock().snapshots.get(&doc_key(collection, id)).cloned()
    }
}

impl OtDb for MemoryDb {
    fn commit(
        &self,
        collection: &str,
        id: &str,
        op: &Operation,
        snapshot: &Snapshot,
        _options: &CommitOptions,
    ) -> Result<bool> {
        self.lifecycle.ensure_open()?;
        snapshot.check_commit(id)?;

        let key = doc_key(collection, id);
        let mut state = self.state.lock();
        let current = state.snapshots.get(&key).map_or(0, |s| s.v);
        let latest_op = state.ops.get(&key).map_or(0, |ops| ops.len() as Version);
        let next = current.checked_add(1);
        if next != Some(snapshot.v) || latest_op.checked_add(1) != Some(snapshot.v) {
            drop(state);
            debug!(collection, doc_id = id, version = snapshot.v, "commit lost version race");
            return Ok(false);
        }
        state.snapshots.insert(key.clone(), snapshot.clone());
        state.ops.entry(key).or_default().push(op.clone());
        // Refresh before unlocking so commits reach the cache in version order.
        self.cache.refresh(collection, id, snapshot);
        Ok(true)
    }

    fn get_snapshot(
        &self,
        collection: &str,
        id: &str,
        fields: Option<&Projection>,
        options: &ReadOptions,
    ) -> Result<Snapshot> {
        self.lifecycle.ensure_open()?;
        if let Some(hit) = self.cache.lookup(collection, id) {
            return Ok(hit.present(fields, options));
        }
        match self.load_snapshot(collection, id) {
            Some(snapshot) => {
                self.cache.refresh(collection, id, &snapshot);
                Ok(snapshot.present(fields, options))
            }
            None => Ok(Snapshot::missing(id)),
        }
    }

    fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: &[String],
        fields: Option<&Projection>,
        options: &ReadOptions,
    ) -> Result<HashMap<String, Snapshot>> {
        self.lifecycle.ensure_open()?;
        let mut out = HashMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        for id in ids {
            match self.cache.lookup(collection, id) {
                Some(hit) => {
                    out.insert(id.clone(), hit.present(fields, options));
                }
                None => misses.push(id),
            }
        }
        if misses.is_empty() {
            return Ok(out);
        }

        self.durable_reads.fetch_add(1, Ordering::Relaxed);
        let found: Vec<(String, Option<Snapshot>)> = {
            let state = self.state.lock();
            misses
                .iter()
                .map(|id| ((*id).clone(), state.snapshots.get(&doc_key(collection, id)).cloned()))
                .collect()
        };
        for (id, snapshot) in found {
            let snapshot = match snapshot {
                Some(snapshot) => {
                    self.cache.refresh(collection, &id, &snapshot);
                    snapshot.present(fields, options)
                }
                None => Snapshot::missing(id.clone()),
            };
            out.insert(id, snapshot);
        }
        Ok(out)
    }

    fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: Version,
        to: Option<Version>,
        _options: &ReadOptions,
    ) -> Result<Vec<Operation>> {
        self.lifecycle.ensure_open()?;
        let state = self.state.lock();
        let Some(ops) = state.ops.get(&doc_key(collection, id)) else {
            return Ok(Vec::new());
        };
        let len = ops.len();
        let start = usize::try_from(from.max(1) - 1).unwrap_or(usize::MAX).min(len);
        let end = match to {
            None => len,
            Some(to) => usize::try_from(to.saturating_sub(1))
                .unwrap_or(usize::MAX)
                .min(len),
        };
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(ops[start..end].to_vec())
    }

    fn query(
        &self,
        collection: &str,
        query: &Value,
        fields: Option<&Projection>,
        options: &ReadOptions,
    ) -> Result<QueryResult> {
        self.lifecycle.ensure_open()?;
        let plan = query::prepare_query(query, &self.query_config)?;

        let mut matched: Vec<Snapshot> = {
            let state = self.state.lock();
            state
                .snapshots
                .range(doc_key(collection, "")..)
                .take_while(|((c, _), _)| c == collection)
                .map(|(_, s)| s)
                .filter(|s| query::matches(s, &plan.predicate))
                .cloned()
                .collect()
        };

        match &plan.aggregation {
            Some(Aggregation::Count) => {
                return Ok(QueryResult {
                    snapshots: Vec::new(),
                    extra: Some(Value::from(matched.len() as u64)),
                });
            }
            Some(Aggregation::Distinct(field)) => {
                return Ok(QueryResult {
                    snapshots: Vec::new(),
                    extra: Some(Value::Array(query::distinct_values(&matched, field))),
                });
            }
            None => {}
        }

        if !plan.sort.is_empty() {
            matched.sort_by(|a, b| query::cmp_snapshots(a, b, &plan.sort));
        }
        let skip = plan.skip.map_or(0, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let limit = plan.limit.map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let snapshots = matched
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|s| s.present(fields, options))
            .collect();
        Ok(QueryResult {
            snapshots,
            extra: None,
        })
    }

    fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        info!("closing in-memory document store");
        self.lifecycle.finish_close();
    }
}
