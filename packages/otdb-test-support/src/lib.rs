//! Backend-agnostic conformance checks for [`OtDb`] implementations.
//!
//! Each check takes a collection name the caller guarantees is empty, so durable backends can
//! isolate runs with a fresh name per test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use otdb_core::{
    cache_key, CommitOptions, Error, MemorySnapshotCache, Operation, OtDb, Projection,
    ReadOptions, Result, Snapshot, SnapshotCache, Version,
};

const DOC_TYPE: &str = "json0";

fn opts() -> ReadOptions {
    ReadOptions::default()
}

fn commit_opts() -> CommitOptions {
    CommitOptions::default()
}

fn edit(n: u64) -> Operation {
    Operation::edit(json!([{ "p": ["n"], "na": n }])).from_source("conformance", n)
}

/// Create `id` at v1 and apply edits up to `version`, returning the ops as submitted.
fn build_history<D: OtDb + ?Sized>(db: &D, collection: &str, id: &str, version: u64) -> Vec<Operation> {
    let create = Operation::create(DOC_TYPE, json!({ "n": 0 }));
    let first = Snapshot::new(id, 1, DOC_TYPE, json!({ "n": 0 }));
    assert!(db.commit(collection, id, &create, &first, &commit_opts()).unwrap());
    let mut ops = vec![create];
    for v in 2..=version {
        let op = edit(v).at_version(v - 1);
        let snapshot = Snapshot::new(id, v, DOC_TYPE, json!({ "n": v }));
        assert!(db.commit(collection, id, &op, &snapshot, &commit_opts()).unwrap(), "commit v{v}");
        ops.push(op);
    }
    ops
}

pub fn sequential_commits_advance_version<D: OtDb + ?Sized>(db: &D, collection: &str) {
    let ops = build_history(db, collection, "doc", 5);

    let snapshot = db.get_snapshot(collection, "doc", None, &opts()).unwrap();
    assert_eq!(snapshot.v, 5);
    assert_eq!(snapshot.doc_type.as_deref(), Some(DOC_TYPE));
    assert_eq!(snapshot.data, Some(json!({ "n": 5 })));

    let log = db.get_ops(collection, "doc", 1, None, &opts()).unwrap();
    assert_eq!(log, ops);
}

pub fn stale_commit_is_rejected_without_side_effects<D: OtDb + ?Sized>(db: &D, collection: &str) {
    build_history(db, collection, "doc", 2);

    let replay = Snapshot::new("doc", 2, DOC_TYPE, json!({ "n": 99 }));
    assert!(!db.commit(collection, "doc", &edit(99), &replay, &commit_opts()).unwrap());
    let gap = Snapshot::new("doc", 4, DOC_TYPE, json!({ "n": 99 }));
    assert!(!db.commit(collection, "doc", &edit(99), &gap, &commit_opts()).unwrap());
    let fresh_create = Snapshot::new("other", 2, DOC_TYPE, json!({}));
    let create = Operation::create(DOC_TYPE, json!({}));
    assert!(!db
        .commit(collection, "other", &create, &fresh_create, &commit_opts())
        .unwrap());

    let snapshot = db.get_snapshot(collection, "doc", None, &opts()).unwrap();
    assert_eq!(snapshot.v, 2);
    assert_eq!(snapshot.data, Some(json!({ "n": 2 })));
    assert_eq!(db.get_ops(collection, "doc", 1, None, &opts()).unwrap().len(), 2);
    assert_eq!(
        db.get_snapshot(collection, "other", None, &opts()).unwrap(),
        Snapshot::missing("other")
    );
    assert!(db.get_ops(collection, "other", 1, None, &opts()).unwrap().is_empty());
}

pub fn concurrent_commits_have_one_winner<D: OtDb + ?Sized>(db: &D, collection: &str) {
    const WRITERS: usize = 8;
    build_history(db, collection, "doc", 1);

    let winners = AtomicUsize::new(0);
    let winner_id = AtomicUsize::new(usize::MAX);
    thread::scope(|s| {
        for writer in 0..WRITERS {
            let winners = &winners;
            let winner_id = &winner_id;
            s.spawn(move || {
                let snapshot = Snapshot::new("doc", 2, DOC_TYPE, json!({ "writer": writer }));
                let op = Operation::edit(json!([{ "p": ["writer"], "oi": writer }]))
                    .from_source(format!("writer-{writer}"), 1);
                if db.commit(collection, "doc", &op, &snapshot, &commit_opts()).unwrap() {
                    winners.fetch_add(1, Ordering::SeqCst);
                    winner_id.store(writer, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    let winner = winner_id.load(Ordering::SeqCst);
    let snapshot = db.get_snapshot(collection, "doc", None, &opts()).unwrap();
    assert_eq!(snapshot.v, 2);
    assert_eq!(snapshot.data, Some(json!({ "writer": winner })));

    let log = db.get_ops(collection, "doc", 1, None, &opts()).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].src.as_deref(), Some(format!("writer-{winner}").as_str()));
}

pub fn op_range_is_half_open<D: OtDb + ?Sized>(db: &D, collection: &str) {
    let ops = build_history(db, collection, "doc", 5);
    let range = |from, to| db.get_ops(collection, "doc", from, to, &opts()).unwrap();

    assert_eq!(range(2, Some(4)), ops[1..3].to_vec());
    assert_eq!(range(5, None), ops[4..].to_vec());
    assert_eq!(range(1, Some(100)), ops);
    assert_eq!(range(0, None), ops);
    assert!(range(6, None).is_empty());
    assert!(range(3, Some(3)).is_empty());
    assert!(range(4, Some(2)).is_empty());
    assert!(db
        .get_ops(collection, "missing", 1, None, &opts())
        .unwrap()
        .is_empty());
}

pub fn snapshot_round_trip<D: OtDb + ?Sized>(db: &D, collection: &str) {
    let data = json!({
        "title": "notes",
        "tags": ["a", "b"],
        "owner": { "name": "bob", "age": 41 },
        "archived": false,
        "score": null
    });
    let snapshot = Snapshot::new("doc", 1, DOC_TYPE, data.clone()).with_meta(json!({ "ctime": 1700 }));
    let create = Operation::create(DOC_TYPE, data.clone());
    assert!(db
        .commit(collection, "doc", &create, &snapshot, &commit_opts())
        .unwrap());

    let plain = db.get_snapshot(collection, "doc", None, &opts()).unwrap();
    assert_eq!(plain.data, Some(data));
    assert_eq!(plain.m, None);

    let with_meta = db
        .get_snapshot(collection, "doc", None, &ReadOptions::with_metadata())
        .unwrap();
    assert_eq!(with_meta, snapshot);

    let projected = db
        .get_snapshot(collection, "doc", Some(&Projection::new(["title", "owner"])), &opts())
        .unwrap();
    assert_eq!(
        projected.data,
        Some(json!({ "title": "notes", "owner": { "name": "bob", "age": 41 } }))
    );

    assert_eq!(
        db.get_snapshot(collection, "nope", None, &opts()).unwrap(),
        Snapshot::missing("nope")
    );
}

pub fn bulk_snapshots_cover_every_id<D: OtDb + ?Sized>(db: &D, collection: &str) {
    build_history(db, collection, "a", 1);
    build_history(db, collection, "b", 3);
    let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

    let out = db.get_snapshot_bulk(collection, &ids, None, &opts()).unwrap();
    assert_eq!(out.len(), 3);
    assert_eq!(out["a"].v, 1);
    assert_eq!(out["b"].v, 3);
    assert_eq!(out["c"], Snapshot::missing("c"));
}

pub fn delete_keeps_version_and_recreate_continues<D: OtDb + ?Sized>(db: &D, collection: &str) {
    build_history(db, collection, "doc", 1);

    let bad_tombstone = Snapshot {
        data: Some(json!({})),
        ..Snapshot::tombstone("doc", 2)
    };
    assert!(matches!(
        db.commit(collection, "doc", &Operation::delete(), &bad_tombstone, &commit_opts()),
        Err(Error::InvalidOperation(_))
    ));

    let tombstone = Snapshot::tombstone("doc", 2);
    assert!(db
        .commit(collection, "doc", &Operation::delete(), &tombstone, &commit_opts())
        .unwrap());
    let deleted = db.get_snapshot(collection, "doc", None, &opts()).unwrap();
    assert_eq!(deleted, Snapshot::tombstone("doc", 2));
    assert!(deleted.is_tombstone());

    let create = Operation::create(DOC_TYPE, json!({ "again": true }));
    let restart = Snapshot::new("doc", 1, DOC_TYPE, json!({ "again": true }));
    assert!(!db.commit(collection, "doc", &create, &restart, &commit_opts()).unwrap());
    let recreated = Snapshot::new("doc", 3, DOC_TYPE, json!({ "again": true }));
    assert!(db.commit(collection, "doc", &create, &recreated, &commit_opts()).unwrap());

    let log = db.get_ops(collection, "doc", 1, None, &opts()).unwrap();
    assert_eq!(log.len(), 3);
    assert!(log[0].is_create());
    assert!(log[1].is_delete());
    assert!(log[2].is_create());
}

fn ids(snapshots: &[Snapshot]) -> Vec<&str> {
    snapshots.iter().map(|s| s.id.as_str()).collect()
}

fn seed_people<D: OtDb + ?Sized>(db: &D, collection: &str) {
    let people = [
        ("a", json!({ "name": "bob", "age": 30, "team": "red" })),
        ("b", json!({ "name": "alice", "age": 25, "team": "blue" })),
        ("c", json!({ "name": "bob", "age": 50 })),
        ("d", json!({ "name": "carol", "age": 41, "team": "red" })),
    ];
    for (id, data) in people {
        let snapshot = Snapshot::new(id, 1, DOC_TYPE, data.clone());
        assert!(db
            .commit(
                collection,
                id,
                &Operation::create(DOC_TYPE, data),
                &snapshot,
                &commit_opts(),
            )
            .unwrap());
    }
    // "c" becomes a tombstone.
    let tombstone = Snapshot::tombstone("c", 2);
    assert!(db
        .commit(collection, "c", &Operation::delete(), &tombstone, &commit_opts())
        .unwrap());
}

pub fn queries_never_return_tombstones<D: OtDb + ?Sized>(db: &D, collection: &str) {
    seed_people(db, collection);
    let query = |q: Value| db.query(collection, &q, None, &opts()).unwrap();

    assert_eq!(ids(&query(json!({ "name": "bob" })).snapshots), ["a"]);
    assert_eq!(ids(&query(json!({})).snapshots), ["a", "b", "d"]);
    assert_eq!(ids(&query(json!({ "nickname": null })).snapshots), ["a", "b", "d"]);
    assert_eq!(ids(&query(json!({ "team": { "$exists": false } })).snapshots), Vec::<&str>::new());
    assert_eq!(
        ids(&query(json!({ "$or": [{ "name": "bob" }, { "name": "alice" }] })).snapshots),
        ["a", "b"]
    );
    assert_eq!(query(json!({ "$count": true })).extra, Some(json!(3)));
    // explicit _type clauses are respected
    assert_eq!(ids(&query(json!({ "_type": null })).snapshots), ["c"]);
}

pub fn query_operators_and_cursor_transforms<D: OtDb + ?Sized>(db: &D, collection: &str) {
    seed_people(db, collection);
    let query = |q: Value| db.query(collection, &q, None, &opts()).unwrap();

    assert_eq!(ids(&query(json!({ "age": { "$gt": 26, "$lte": 41 } })).snapshots), ["a", "d"]);
    assert_eq!(ids(&query(json!({ "team": { "$in": ["blue", "green"] } })).snapshots), ["b"]);
    assert_eq!(ids(&query(json!({ "team": { "$ne": "red" } })).snapshots), ["b"]);
    assert_eq!(ids(&query(json!({ "_id": { "$nin": ["a", "b"] } })).snapshots), ["d"]);
    assert_eq!(
        ids(&query(json!({ "age": { "$type": "number" }, "$sort": { "age": -1 } })).snapshots),
        ["d", "a", "b"]
    );
    assert_eq!(
        ids(&query(json!({ "team": "red", "$sort": { "name": 1 }, "$skip": 1, "$limit": 5 })).snapshots),
        ["d"]
    );
    assert_eq!(
        query(json!({ "team": { "$exists": true }, "$distinct": { "field": "team" } })).extra,
        Some(json!(["blue", "red"]))
    );

    let projected = db
        .query(
            collection,
            &json!({ "name": "alice" }),
            Some(&Projection::new(["team"])),
            &opts(),
        )
        .unwrap();
    assert_eq!(projected.snapshots.len(), 1);
    assert_eq!(projected.snapshots[0].data, Some(json!({ "team": "blue" })));
}

pub fn string_sort_is_bytewise<D: OtDb + ?Sized>(db: &D, collection: &str) {
    for (id, name) in [("1", "alice"), ("2", "Bob"), ("3", "carol")] {
        let data = json!({ "name": name });
        let snapshot = Snapshot::new(id, 1, DOC_TYPE, data.clone());
        let op = Operation::create(DOC_TYPE, data);
        assert!(db.commit(collection, id, &op, &snapshot, &commit_opts()).unwrap());
    }
    let query = |q: Value| db.query(collection, &q, None, &opts()).unwrap();

    assert_eq!(ids(&query(json!({ "$sort": { "name": 1 } })).snapshots), ["2", "1", "3"]);
    assert_eq!(ids(&query(json!({ "$sort": { "name": -1 } })).snapshots), ["3", "1", "2"]);
    assert_eq!(ids(&query(json!({ "name": { "$lt": "alice" } })).snapshots), ["2"]);
}

pub fn conflicting_operators_are_rejected<D: OtDb + ?Sized>(db: &D, collection: &str) {
    seed_people(db, collection);
    let err = db
        .query(
            collection,
            &json!({ "$distinct": { "field": "x" }, "$mapReduce": { "map": "f", "reduce": "g" } }),
            None,
            &opts(),
        )
        .unwrap_err();
    assert_eq!(err.code(), Some(4108));
    let msg = err.to_string();
    assert!(msg.contains("$distinct") && msg.contains("$mapReduce"), "{msg}");

    let err = db
        .query(collection, &json!({ "$where": "true" }), None, &opts())
        .unwrap_err();
    assert_eq!(err.code(), Some(4103));

    // the store is still usable afterwards
    assert_eq!(db.query(collection, &json!({}), None, &opts()).unwrap().snapshots.len(), 3);
}

/// Closes `db`; call last.
pub fn closed_instance_rejects_everything<D: OtDb + ?Sized>(db: &D, collection: &str) {
    build_history(db, collection, "doc", 1);
    db.close();
    db.close();

    let next = Snapshot::new("doc", 2, DOC_TYPE, json!({}));
    let results = [
        db.commit(collection, "doc", &edit(2), &next, &commit_opts()).map(|_| ()),
        db.get_snapshot(collection, "doc", None, &opts()).map(|_| ()),
        db.get_snapshot_bulk(collection, &["doc".to_string()], None, &opts()).map(|_| ()),
        db.get_ops(collection, "doc", 1, None, &opts()).map(|_| ()),
        db.query(collection, &json!({}), None, &opts()).map(|_| ()),
    ];
    for result in results {
        assert!(matches!(result, Err(Error::AlreadyClosed)), "{result:?}");
    }
}

/// [`SnapshotCache`] whose next conditional write can be held back, so a slow cache write lands
/// after a later one.
#[derive(Default)]
pub struct SlowCache {
    inner: MemorySnapshotCache,
    hold: Mutex<Option<(Duration, mpsc::Sender<()>)>>,
}

impl SlowCache {
    /// Delay the next `set_if_newer` by `delay`. The receiver fires once that write is waiting.
    pub fn hold_next_write(&self, delay: Duration) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel();
        *self.hold.lock() = Some((delay, tx));
        rx
    }

    fn pause(&self) {
        let held = self.hold.lock().take();
        if let Some((delay, waiting)) = held {
            let _ = waiting.send(());
            thread::sleep(delay);
        }
    }
}

impl SnapshotCache for SlowCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn set_if_newer(&self, key: &str, version: Version, value: String) -> Result<bool> {
        self.pause();
        self.inner.set_if_newer(key, version, value)
    }
}

const HELD_WRITE: Duration = Duration::from_millis(200);

/// `db` must read through `cache`. A commit whose cache refresh stalls must not leave its
/// older snapshot cached over a later commit.
pub fn delayed_commit_refresh_keeps_newest<D: OtDb + ?Sized>(
    db: &D,
    cache: &SlowCache,
    collection: &str,
) {
    let waiting = cache.hold_next_write(HELD_WRITE);
    thread::scope(|s| {
        let first = s.spawn(|| {
            let snapshot = Snapshot::new("doc", 1, DOC_TYPE, json!({ "n": 1 }));
            let op = Operation::create(DOC_TYPE, json!({ "n": 1 }));
            db.commit(collection, "doc", &op, &snapshot, &commit_opts()).unwrap()
        });
        waiting.recv_timeout(Duration::from_secs(10)).unwrap();

        let second = Snapshot::new("doc", 2, DOC_TYPE, json!({ "n": 2 }));
        assert!(db
            .commit(collection, "doc", &edit(2), &second, &commit_opts())
            .unwrap());
        assert!(first.join().unwrap());
    });

    let snapshot = db.get_snapshot(collection, "doc", None, &opts()).unwrap();
    assert_eq!(snapshot.v, 2);
    assert_eq!(snapshot.data, Some(json!({ "n": 2 })));
}

/// `db` must read through `cache`. A read that loaded an older snapshot must not cache it over
/// a commit that landed while the read was in flight.
pub fn delayed_read_populate_keeps_newest<D: OtDb + ?Sized>(
    db: &D,
    cache: &SlowCache,
    collection: &str,
) {
    build_history(db, collection, "doc", 1);
    cache.delete(&cache_key(collection, "doc")).unwrap();

    let waiting = cache.hold_next_write(HELD_WRITE);
    thread::scope(|s| {
        let reader = s.spawn(|| db.get_snapshot(collection, "doc", None, &opts()).unwrap());
        waiting.recv_timeout(Duration::from_secs(10)).unwrap();

        let next = Snapshot::new("doc", 2, DOC_TYPE, json!({ "n": 2 }));
        assert!(db
            .commit(collection, "doc", &edit(2), &next, &commit_opts())
            .unwrap());
        assert_eq!(reader.join().unwrap().v, 1);
    });

    let snapshot = db.get_snapshot(collection, "doc", None, &opts()).unwrap();
    assert_eq!(snapshot.v, 2);
    assert_eq!(snapshot.data, Some(json!({ "n": 2 })));
}
