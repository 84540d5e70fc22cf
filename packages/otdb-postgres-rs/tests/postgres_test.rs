use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use otdb_core::{
    CacheConfig, CommitOptions, Error, MemorySnapshotCache, Operation, OtDb, ReadOptions, Snapshot,
};
use otdb_postgres::{reset_collection_for_tests, PgConfig, PostgresDb};
use otdb_test_support::{self as suite, SlowCache};

fn config() -> Option<PgConfig> {
    let url = std::env::var("OTDB_POSTGRES_URL").ok()?;
    Some(
        PgConfig::new(url)
            .pool_size(4)
            .acquire_timeout(Duration::from_secs(10)),
    )
}

fn open_with(config: PgConfig) -> PostgresDb {
    let db = PostgresDb::open(config).unwrap();
    static SCHEMA: OnceLock<()> = OnceLock::new();
    SCHEMA.get_or_init(|| db.ensure_schema().unwrap());
    db
}

fn open() -> Option<PostgresDb> {
    config().map(open_with)
}

fn collection() -> String {
    format!("test-{}", Uuid::new_v4())
}

macro_rules! conformance {
    ($($name:ident),* $(,)?) => {
        $(
            #[test]
            fn $name() {
                let Some(db) = open() else {
                    return;
                };
                suite::$name(&db, &collection());
            }
        )*
    };
}

conformance!(
    sequential_commits_advance_version,
    stale_commit_is_rejected_without_side_effects,
    concurrent_commits_have_one_winner,
    op_range_is_half_open,
    snapshot_round_trip,
    bulk_snapshots_cover_every_id,
    delete_keeps_version_and_recreate_continues,
    queries_never_return_tombstones,
    query_operators_and_cursor_transforms,
    string_sort_is_bytewise,
    conflicting_operators_are_rejected,
    closed_instance_rejects_everything,
);

#[test]
fn conformance_with_bundled_cache() {
    let Some(config) = config() else {
        return;
    };
    let db = open_with(config.cache(CacheConfig { ttl_ms: Some(60_000) }));
    suite::snapshot_round_trip(&db, &collection());
    suite::delete_keeps_version_and_recreate_continues(&db, &collection());
    suite::concurrent_commits_have_one_winner(&db, &collection());
}

#[test]
fn existing_documents_advance_past_first_version() {
    let Some(db) = open() else {
        return;
    };
    let c = collection();
    suite::delete_keeps_version_and_recreate_continues(&db, &c);
    let log = db.get_ops(&c, "doc", 2, None, &ReadOptions::default()).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(
        db.get_snapshot(&c, "doc", None, &ReadOptions::default()).unwrap().v,
        3
    );
}

#[test]
fn delayed_cache_writes_keep_newest() {
    let Some(config) = config() else {
        return;
    };
    let cache = Arc::new(SlowCache::default());
    let db = open_with(config).with_cache(cache.clone());
    suite::delayed_commit_refresh_keeps_newest(&db, &cache, &collection());
    suite::delayed_read_populate_keeps_newest(&db, &cache, &collection());
}

#[test]
fn rejected_queries_do_not_hold_connections() {
    let Some(config) = config() else {
        return;
    };
    let db = open_with(config.pool_size(1));
    let c = collection();

    for _ in 0..5 {
        let err = db
            .query(&c, &json!({ "$query": { "x": 1 } }), None, &ReadOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), Some(4106));
    }
    let ops = db.get_ops(&c, "doc", 1, None, &ReadOptions::default());
    assert!(ops.unwrap().is_empty());

    let status = db.pool_status();
    assert!(status.open <= 1);
    assert_eq!(status.open, status.idle);
    assert!(db.query(&c, &json!({}), None, &ReadOptions::default()).is_ok());
}

#[test]
fn stale_cache_until_invalidated() {
    let Some(config) = config() else {
        return;
    };
    let cache = Arc::new(MemorySnapshotCache::new(None));
    let writer = open_with(config.clone());
    let reader = open_with(config).with_cache(cache);
    let c = collection();

    suite::snapshot_round_trip(&writer, &c);
    let first = reader
        .get_snapshot(&c, "doc", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(first.v, 1);

    // writer advances the document behind the reader's cache
    let next = Snapshot::new("doc", 2, "json0", json!({ "title": "changed" }));
    let op = Operation::edit(json!([]));
    assert!(writer
        .commit(&c, "doc", &op, &next, &CommitOptions::default())
        .unwrap());

    let stale = reader
        .get_snapshot(&c, "doc", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(stale.v, 1);

    reader.invalidate_cached(&c, "doc");
    let fresh = reader
        .get_snapshot(&c, "doc", None, &ReadOptions::default())
        .unwrap();
    assert_eq!(fresh, next);
}

#[test]
fn close_releases_pool() {
    let Some(db) = open() else {
        return;
    };
    db.query(&collection(), &json!({}), None, &ReadOptions::default())
        .unwrap();
    db.close();
    let status = db.pool_status();
    assert!(status.closed);
    assert_eq!(status.open, 0);
    assert!(matches!(db.ensure_schema(), Err(Error::AlreadyClosed)));
}

#[test]
fn reset_clears_collection() {
    let Some(config) = config() else {
        return;
    };
    let db = open_with(config.clone());
    let c = collection();
    suite::sequential_commits_advance_version(&db, &c);

    let mut client = postgres::Client::connect(&config.url, postgres::NoTls).unwrap();
    reset_collection_for_tests(&mut client, &c).unwrap();
    db.invalidate_cached(&c, "doc");
    assert_eq!(
        db.get_snapshot(&c, "doc", None, &ReadOptions::default())
            .unwrap()
            .v,
        0
    );
}
