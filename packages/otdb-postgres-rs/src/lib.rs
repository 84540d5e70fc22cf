#![forbid(unsafe_code)]
//! PostgreSQL persistence for `otdb-core`.
//!
//! Snapshots and ops live in two plain tables; commit atomicity comes from a single transaction
//! per commit with a row lock on the snapshot. Queries are validated in `otdb-core` and rendered
//! to SQL here.

mod config;
mod pool;
mod schema;
mod sql;
mod store;

use otdb_core::Error;

pub use config::{PgConfig, DEFAULT_POOL_SIZE};
pub use pool::{PgPool, PoolStatus, PooledClient};
pub use schema::{ensure_schema, reset_collection_for_tests};
pub use store::PostgresDb;

pub(crate) fn storage_debug<E: std::fmt::Debug>(e: E) -> Error {
    Error::Storage(format!("{e:?}"))
}
