use std::collections::HashMap;
use std::sync::Arc;

use postgres::error::SqlState;
use postgres::{Client, Row};
use serde_json::Value;
use tracing::{debug, info, warn};

use otdb_core::query::eval::cmp_json;
use otdb_core::{
    prepare_query, CacheLayer, CommitOptions, Error, Lifecycle, Operation, OtDb, Projection,
    QueryConfig, QueryResult, ReadOptions, Result, Snapshot, SnapshotCache, Version,
};

use crate::config::PgConfig;
use crate::pool::{PgPool, PoolStatus, PooledClient};
use crate::schema;
use crate::sql::{render_query, StatementKind, SNAPSHOT_COLUMNS};
use crate::storage_debug;

fn to_db_version(v: Version) -> Result<i64> {
    i64::try_from(v).map_err(|_| Error::InvalidOperation(format!("version {v} out of range")))
}

fn from_db_version(v: i64) -> Result<Version> {
    Version::try_from(v).map_err(|_| Error::Storage(format!("negative version {v} in storage")))
}

fn row_to_snapshot(row: &Row) -> Result<Snapshot> {
    Ok(Snapshot {
        id: row.try_get(0).map_err(storage_debug)?,
        doc_type: row.try_get(1).map_err(storage_debug)?,
        v: from_db_version(row.try_get(2).map_err(storage_debug)?)?,
        data: row.try_get(3).map_err(storage_debug)?,
        m: row.try_get(4).map_err(storage_debug)?,
    })
}

fn is_unique_violation(e: &postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

/// Snapshot + op log store on PostgreSQL.
///
/// Each public operation borrows one pooled connection and releases it before returning.
/// Queries are validated and rendered before a connection is borrowed.
pub struct PostgresDb {
    pool: PgPool,
    cache: CacheLayer,
    query_config: QueryConfig,
    lifecycle: Lifecycle,
}

impl PostgresDb {
    /// Build the store. Connections are opened lazily on first use.
    pub fn open(config: PgConfig) -> Result<Self> {
        let pool = PgPool::new(&config.url, config.pool_size, config.acquire_timeout_duration())?;
        info!(pool_size = config.pool_size, cache = config.cache.is_some(), "opening postgres document store");
        Ok(Self {
            pool,
            cache: CacheLayer::from_config(config.cache.as_ref()),
            query_config: config.query,
            lifecycle: Lifecycle::new(),
        })
    }

    /// Replace the snapshot cache with an external engine.
    pub fn with_cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        self.cache = CacheLayer::new(cache);
        self
    }

    pub fn ensure_schema(&self) -> Result<()> {
        self.lifecycle.ensure_open()?;
        let mut client = self.pool.get()?;
        schema::ensure_schema(&mut client)
    }

    /// Drop the cached snapshot of a document written outside this instance.
    pub fn invalidate_cached(&self, collection: &str, id: &str) {
        self.cache.invalidate(collection, id);
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    fn load_snapshots(&self, collection: &str, ids: &[String]) -> Result<Vec<Snapshot>> {
        let rows = {
            let mut client = self.pool.get()?;
            client
                .query(
                    format!(
                        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE collection = $1 AND doc_id = ANY($2)"
                    )
                    .as_str(),
                    &[&collection, &ids],
                )
                .map_err(storage_debug)?
        };
        rows.iter().map(row_to_snapshot).collect()
    }
}

// `$4` must be cast explicitly: `$4 - 1` alone would make Postgres infer int4.
const ADVANCE_SNAPSHOT_SQL: &str = "UPDATE snapshots \
     SET doc_type = $3, version = $4::bigint, data = $5, metadata = $6 \
     WHERE collection = $1 AND doc_id = $2 AND version = $4::bigint - 1";

// Steps of a commit inside an open transaction. `Ok(false)` means the version race was lost.
fn commit_in_tx(
    client: &mut Client,
    collection: &str,
    id: &str,
    version: i64,
    op: &Value,
    snapshot: &Snapshot,
) -> std::result::Result<bool, postgres::Error> {
    let current: Option<i64> = client
        .query_opt(
            "SELECT version FROM snapshots WHERE collection = $1 AND doc_id = $2 FOR UPDATE",
            &[&collection, &id],
        )?
        .map(|row| row.get(0));

    if current.unwrap_or(0).checked_add(1) != Some(version) {
        return Ok(false);
    }

    let written = match current {
        None => client.execute(
            "INSERT INTO snapshots (collection, doc_id, doc_type, version, data, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (collection, doc_id) DO NOTHING",
            &[&collection, &id, &snapshot.doc_type, &version, &snapshot.data, &snapshot.m],
        )?,
        Some(_) => client.execute(
            ADVANCE_SNAPSHOT_SQL,
            &[&collection, &id, &snapshot.doc_type, &version, &snapshot.data, &snapshot.m],
        )?,
    };
    if written == 0 {
        return Ok(false);
    }

    let appended = client.execute(
        "INSERT INTO ops (collection, doc_id, version, operation) \
         SELECT $1::text, $2::text, $3::bigint, $4::jsonb \
         WHERE $3::bigint = ( \
           SELECT COALESCE(MAX(version), 0) + 1 FROM ops WHERE collection = $1 AND doc_id = $2 \
         ) \
         ON CONFLICT (collection, doc_id, version) DO NOTHING",
        &[&collection, &id, &version, op],
    )?;
    Ok(appended > 0)
}

fn rollback(client: &mut PooledClient<'_>) {
    if let Err(e) = client.batch_execute("ROLLBACK") {
        warn!(error = ?e, "rollback failed; discarding connection");
        client.discard();
    }
}

impl OtDb for PostgresDb {
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
        let version = to_db_version(snapshot.v)?;
        let op_json =
            serde_json::to_value(op).map_err(|e| Error::InvalidOperation(e.to_string()))?;

        let committed = {
            let mut client = self.pool.get()?;
            client.batch_execute("BEGIN").map_err(storage_debug)?;

            match commit_in_tx(&mut client, collection, id, version, &op_json, snapshot) {
                Ok(true) => match client.batch_execute("COMMIT") {
                    Ok(()) => true,
                    Err(e) if is_unique_violation(&e) => {
                        rollback(&mut client);
                        false
                    }
                    Err(e) => {
                        rollback(&mut client);
                        return Err(storage_debug(e));
                    }
                },
                Ok(false) => {
                    rollback(&mut client);
                    false
                }
                Err(e) if is_unique_violation(&e) => {
                    rollback(&mut client);
                    false
                }
                Err(e) => {
                    rollback(&mut client);
                    return Err(storage_debug(e));
                }
            }
        };

        if committed {
            self.cache.refresh(collection, id, snapshot);
        } else {
            debug!(collection, doc_id = id, version = snapshot.v, "commit lost version race");
        }
        Ok(committed)
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

        let row = {
            let mut client = self.pool.get()?;
            client
                .query_opt(
                    format!(
                        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE collection = $1 AND doc_id = $2"
                    )
                    .as_str(),
                    &[&collection, &id],
                )
                .map_err(storage_debug)?
        };
        match row {
            Some(row) => {
                let snapshot = row_to_snapshot(&row)?;
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
                None => misses.push(id.clone()),
            }
        }
        if misses.is_empty() {
            return Ok(out);
        }

        for snapshot in self.load_snapshots(collection, &misses)? {
            self.cache.refresh(collection, &snapshot.id, &snapshot);
            out.insert(snapshot.id.clone(), snapshot.present(fields, options));
        }
        for id in misses {
            out.entry(id.clone()).or_insert_with(|| Snapshot::missing(id));
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
        if to.is_some_and(|to| to <= from) {
            return Ok(Vec::new());
        }
        let from = i64::try_from(from).unwrap_or(i64::MAX);
        let to: Option<i64> = to.map(|to| i64::try_from(to).unwrap_or(i64::MAX));

        let rows = {
            let mut client = self.pool.get()?;
            client
                .query(
                    "SELECT version, operation FROM ops \
                     WHERE collection = $1 AND doc_id = $2 AND version >= $3 \
                       AND ($4::bigint IS NULL OR version < $4) \
                     ORDER BY version",
                    &[&collection, &id, &from, &to],
                )
                .map_err(storage_debug)?
        };
        rows.iter()
            .map(|row| {
                let version: i64 = row.try_get(0).map_err(storage_debug)?;
                let raw: Value = row.try_get(1).map_err(storage_debug)?;
                serde_json::from_value(raw).map_err(|e| {
                    Error::Storage(format!("undecodable op {collection}/{id}@{version}: {e}"))
                })
            })
            .collect()
    }

    fn query(
        &self,
        collection: &str,
        query: &Value,
        fields: Option<&Projection>,
        options: &ReadOptions,
    ) -> Result<QueryResult> {
        self.lifecycle.ensure_open()?;
        let plan = prepare_query(query, &self.query_config)?;
        let statement = render_query(collection, &plan)?;

        let rows = {
            let mut client = self.pool.get()?;
            client
                .query(statement.sql.as_str(), &statement.param_refs())
                .map_err(storage_debug)?
        };

        match statement.kind {
            StatementKind::Rows => {
                let snapshots = rows
                    .iter()
                    .map(|row| row_to_snapshot(row).map(|s| s.present(fields, options)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(QueryResult {
                    snapshots,
                    extra: None,
                })
            }
            StatementKind::Count => {
                let count: i64 = match rows.first() {
                    Some(row) => row.try_get(0).map_err(storage_debug)?,
                    None => 0,
                };
                Ok(QueryResult {
                    snapshots: Vec::new(),
                    extra: Some(Value::from(count)),
                })
            }
            StatementKind::Distinct => {
                let mut values = rows
                    .iter()
                    .map(|row| row.try_get::<_, Value>(0).map_err(storage_debug))
                    .collect::<Result<Vec<_>>>()?;
                values.sort_by(cmp_json);
                Ok(QueryResult {
                    snapshots: Vec::new(),
                    extra: Some(Value::Array(values)),
                })
            }
        }
    }

    fn close(&self) {
        if !self.lifecycle.begin_close() {
            return;
        }
        info!("closing postgres document store");
        self.pool.close();
        self.lifecycle.finish_close();
    }
}
