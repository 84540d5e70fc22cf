use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::traits::SnapshotCache;
use crate::types::{Snapshot, Version};

pub fn cache_key(collection: &str, id: &str) -> String {
    format!("{collection}:{id}:snapshots")
}

#[derive(Deserialize)]
struct CachedVersion {
    v: Version,
}

/// Version of a serialized snapshot. Undecodable entries have none and may be overwritten.
pub(crate) fn cached_version(raw: &str) -> Option<Version> {
    serde_json::from_str::<CachedVersion>(raw).ok().map(|c| c.v)
}

/// Cache-aside front for snapshot reads and post-commit refreshes.
///
/// Never authoritative and never fails its caller: every cache error is logged and dropped.
#[derive(Clone, Default)]
pub struct CacheLayer {
    cache: Option<Arc<dyn SnapshotCache>>,
}

impl CacheLayer {
    pub fn disabled() -> Self {
        Self { cache: None }
    }

    pub fn new(cache: Arc<dyn SnapshotCache>) -> Self {
        Self { cache: Some(cache) }
    }

    pub fn from_config(config: Option<&CacheConfig>) -> Self {
        match config {
            None => Self::disabled(),
            Some(config) => Self::new(Arc::new(MemorySnapshotCache::new(config.ttl()))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn lookup(&self, collection: &str, id: &str) -> Option<Snapshot> {
        let cache = self.cache.as_ref()?;
        let key = cache_key(collection, id);
        let raw = match cache.get(&key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(collection, doc_id = id, error = %e, "snapshot cache read failed");
                return None;
            }
        };
        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(collection, doc_id = id, error = %e, "discarding undecodable cached snapshot");
                None
            }
        }
    }

    pub fn refresh(&self, collection: &str, id: &str, snapshot: &Snapshot) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let raw = match serde_json::to_string(snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(collection, doc_id = id, error = %e, "failed to encode snapshot for cache");
                return;
            }
        };
        match cache.set_if_newer(&cache_key(collection, id), snapshot.v, raw) {
            Ok(true) => {}
            Ok(false) => {
                debug!(collection, doc_id = id, version = snapshot.v, "cache already holds a newer snapshot");
            }
            Err(e) => {
                warn!(collection, doc_id = id, version = snapshot.v, error = %e, "snapshot cache write failed");
            }
        }
    }

    pub fn invalidate(&self, collection: &str, id: &str) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Err(e) = cache.delete(&cache_key(collection, id)) {
            warn!(collection, doc_id = id, error = %e, "snapshot cache invalidation failed");
        }
    }
}

struct CachedEntry {
    value: String,
    stored_at: Instant,
}

/// In-process [`SnapshotCache`] with an optional per-entry lifetime.
#[derive(Default)]
pub struct MemorySnapshotCache {
    entries: RwLock<HashMap<String, CachedEntry>>,
    ttl: Option<Duration>,
}

impl MemorySnapshotCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, entry: &CachedEntry) -> bool {
        self.ttl.is_some_and(|ttl| entry.stored_at.elapsed() >= ttl)
    }
}

impl SnapshotCache for MemorySnapshotCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !self.expired(entry) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write();
        if entries.get(key).is_some_and(|entry| self.expired(entry)) {
            entries.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().insert(
            key.to_string(),
            CachedEntry {
                value,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn set_if_newer(&self, key: &str, version: Version, value: String) -> Result<bool> {
        let mut entries = self.entries.write();
        let newer_cached = entries
            .get(key)
            .filter(|entry| !self.expired(entry))
            .and_then(|entry| cached_version(&entry.value))
            .is_some_and(|v| v >= version);
        if newer_cached {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                stored_at: Instant::now(),
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoded(v: Version) -> String {
        serde_json::to_string(&Snapshot::new("doc", v, "json0", json!({ "n": v }))).unwrap()
    }

    #[test]
    fn older_version_never_replaces_newer_entry() {
        let cache = MemorySnapshotCache::new(None);
        assert!(cache.set_if_newer("k", 2, encoded(2)).unwrap());
        assert!(!cache.set_if_newer("k", 1, encoded(1)).unwrap());
        assert!(!cache.set_if_newer("k", 2, encoded(2)).unwrap());
        assert_eq!(cached_version(&cache.get("k").unwrap().unwrap()), Some(2));
        assert!(cache.set_if_newer("k", 3, encoded(3)).unwrap());
    }

    #[test]
    fn expired_or_undecodable_entries_are_replaced() {
        let cache = MemorySnapshotCache::new(Some(Duration::ZERO));
        cache.set("k", encoded(5)).unwrap();
        assert!(cache.set_if_newer("k", 1, encoded(1)).unwrap());

        let cache = MemorySnapshotCache::new(None);
        cache.set("k", "not json".to_string()).unwrap();
        assert!(cache.set_if_newer("k", 1, encoded(1)).unwrap());
    }

    struct PlainCache(MemorySnapshotCache);

    impl SnapshotCache for PlainCache {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key)
        }
        fn set(&self, key: &str, value: String) -> Result<()> {
            self.0.set(key, value)
        }
        fn delete(&self, key: &str) -> Result<()> {
            self.0.delete(key)
        }
    }

    #[test]
    fn default_set_if_newer_compares_versions() {
        let cache = PlainCache(MemorySnapshotCache::new(None));
        assert!(cache.set_if_newer("k", 4, encoded(4)).unwrap());
        assert!(!cache.set_if_newer("k", 3, encoded(3)).unwrap());
        assert_eq!(cached_version(&cache.get("k").unwrap().unwrap()), Some(4));
    }

    #[test]
    fn refresh_keeps_newest_snapshot() {
        let layer = CacheLayer::new(Arc::new(MemorySnapshotCache::new(None)));
        let newer = Snapshot::new("doc", 2, "json0", json!({ "n": 2 }));
        layer.refresh("docs", "doc", &newer);
        layer.refresh("docs", "doc", &Snapshot::new("doc", 1, "json0", json!({ "n": 1 })));
        assert_eq!(layer.lookup("docs", "doc"), Some(newer));
    }
}
