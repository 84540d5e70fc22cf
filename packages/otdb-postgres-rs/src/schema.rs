use postgres::Client;
use tracing::info;

use otdb_core::{Error, Result};

const SCHEMA_LOCK_KEY: i64 = 0x6f7464625f736368; // "otdb_sch"

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
  collection TEXT NOT NULL,
  doc_id TEXT NOT NULL,
  doc_type TEXT,
  version BIGINT NOT NULL,
  data JSONB,
  metadata JSONB,
  PRIMARY KEY (collection, doc_id)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_data
  ON snapshots USING GIN (data jsonb_path_ops);

CREATE TABLE IF NOT EXISTS ops (
  collection TEXT NOT NULL,
  doc_id TEXT NOT NULL,
  version BIGINT NOT NULL,
  operation JSONB NOT NULL,
  PRIMARY KEY (collection, doc_id, version)
);
"#;

pub fn ensure_schema(client: &mut Client) -> Result<()> {
    // Concurrent `CREATE ... IF NOT EXISTS` can still race on the catalog; serialize across
    // processes.
    client
        .query_one("SELECT pg_advisory_lock($1)", &[&SCHEMA_LOCK_KEY])
        .map_err(|e| Error::Storage(format!("{e:?}")))?;

    let res = client
        .batch_execute(SCHEMA_SQL)
        .map_err(|e| Error::Storage(format!("{e:?}")));
    if res.is_ok() {
        info!("ensured snapshots/ops schema");
    }

    // Released with the session anyway.
    let _ = client.query_one("SELECT pg_advisory_unlock($1)", &[&SCHEMA_LOCK_KEY]);

    res
}

pub fn reset_collection_for_tests(client: &mut Client, collection: &str) -> Result<()> {
    client
        .execute("DELETE FROM ops WHERE collection = $1", &[&collection])
        .map_err(|e| Error::Storage(format!("{e:?}")))?;
    client
        .execute("DELETE FROM snapshots WHERE collection = $1", &[&collection])
        .map_err(|e| Error::Storage(format!("{e:?}")))?;
    Ok(())
}
