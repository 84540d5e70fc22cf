use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use otdb_core::{
    cache_key, CommitOptions, Error, MemoryDb, MemorySnapshotCache, Operation, OtDb, ReadOptions,
    Result, Snapshot, SnapshotCache,
};

/// Cache engine that is down: every call fails.
#[derive(Default)]
struct BrokenCache {
    calls: AtomicUsize,
}

impl SnapshotCache for BrokenCache {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(Error::Cache("connection refused".into()))
    }

    fn set(&self, _key: &str, _value: String) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(Error::Cache("connection refused".into()))
    }

    fn delete(&self, _key: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(Error::Cache("connection refused".into()))
    }
}

fn create(db: &MemoryDb, id: &str, data: serde_json::Value) {
    let snapshot = Snapshot::new(id, 1, "json0", data.clone());
    let op = Operation::create("json0", data);
    assert!(db
        .commit("docs", id, &op, &snapshot, &CommitOptions::default())
        .unwrap());
}

#[test]
fn commit_populates_cache_and_read_skips_durable_store() {
    let cache = Arc::new(MemorySnapshotCache::new(None));
    let db = MemoryDb::new().with_cache(cache.clone());
    create(&db, "a", json!({"n": 1}));

    assert_eq!(cache.len(), 1);
    let snapshot = db
        .get_snapshot("docs", "a", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(snapshot.v, 1);
    assert_eq!(db.durable_reads(), 0);
}

#[test]
fn miss_reads_through_and_populates() {
    let cache = Arc::new(MemorySnapshotCache::new(None));
    let db = MemoryDb::new().with_cache(cache.clone());
    create(&db, "a", json!({"n": 1}));
    db.invalidate_cached("docs", "a");
    assert!(cache.is_empty());

    db.get_snapshot("docs", "a", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(db.durable_reads(), 1);
    assert!(cache.get(&cache_key("docs", "a")).unwrap().is_some());

    db.get_snapshot("docs", "a", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(db.durable_reads(), 1);
}

#[test]
fn missing_documents_are_not_cached() {
    let cache = Arc::new(MemorySnapshotCache::new(None));
    let db = MemoryDb::new().with_cache(cache.clone());
    let snapshot = db
        .get_snapshot("docs", "nope", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(snapshot, Snapshot::missing("nope"));
    assert!(cache.is_empty());
}

#[test]
fn broken_cache_never_fails_commit_or_read() {
    let cache = Arc::new(BrokenCache::default());
    let db = MemoryDb::new().with_cache(cache.clone());
    create(&db, "a", json!({"n": 1}));

    let snapshot = db
        .get_snapshot("docs", "a", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(snapshot.data, Some(json!({"n": 1})));
    assert_eq!(db.durable_reads(), 1);
    assert!(cache.calls.load(Ordering::Relaxed) >= 3);
}

#[test]
fn undecodable_entry_falls_back_to_durable_read() {
    let cache = Arc::new(MemorySnapshotCache::new(None));
    let db = MemoryDb::new().with_cache(cache.clone());
    create(&db, "a", json!({"n": 1}));
    cache
        .set(&cache_key("docs", "a"), "not json".to_string())
        .unwrap();

    let snapshot = db
        .get_snapshot("docs", "a", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(snapshot.v, 1);
    assert_eq!(db.durable_reads(), 1);
}

#[test]
fn out_of_band_write_is_stale_until_invalidated() {
    let cache = Arc::new(MemorySnapshotCache::new(None));
    let db = MemoryDb::new().with_cache(cache);
    create(&db, "a", json!({"n": 1}));
    db.put_snapshot_unchecked("docs", Snapshot::new("a", 2, "json0", json!({"n": 2})));

    let stale = db
        .get_snapshot("docs", "a", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(stale.v, 1);

    db.invalidate_cached("docs", "a");
    let fresh = db
        .get_snapshot("docs", "a", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(fresh.v, 2);
}

#[test]
fn entries_expire_after_ttl() {
    let cache = MemorySnapshotCache::new(Some(Duration::from_millis(20)));
    cache.set("k", "v".to_string()).unwrap();
    assert_eq!(cache.get("k").unwrap().as_deref(), Some("v"));
    thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get("k").unwrap(), None);
    assert!(cache.is_empty());
}

#[test]
fn bulk_read_mixes_hits_and_misses() {
    let cache = Arc::new(MemorySnapshotCache::new(None));
    let db = MemoryDb::new().with_cache(cache);
    create(&db, "a", json!({"n": 1}));
    create(&db, "b", json!({"n": 2}));
    db.invalidate_cached("docs", "b");

    let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let out = db
        .get_snapshot_bulk("docs", &ids, None, &ReadOptions::default())
        .unwrap();
    assert_eq!(out.len(), 3);
    assert_eq!(out["a"].v, 1);
    assert_eq!(out["b"].data, Some(json!({"n": 2})));
    assert_eq!(out["c"], Snapshot::missing("c"));
    // one durable round trip for both misses
    assert_eq!(db.durable_reads(), 1);
}

#[test]
fn cached_metadata_is_hidden_unless_requested() {
    let cache = Arc::new(MemorySnapshotCache::new(None));
    let db = MemoryDb::new().with_cache(cache);
    let snapshot = Snapshot::new("a", 1, "json0", json!({})).with_meta(json!({"ctime": 7}));
    let op = Operation::create("json0", json!({}));
    assert!(db
        .commit("docs", "a", &op, &snapshot, &CommitOptions::default())
        .unwrap());

    let plain = db
        .get_snapshot("docs", "a", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(plain.m, None);
    let with_meta = db
        .get_snapshot("docs", "a", None, &ReadOptions::with_metadata())
        .unwrap();
    assert_eq!(with_meta.m, Some(json!({"ctime": 7})));
}
