#![forbid(unsafe_code)]
//! Storage-engine independent core of the OT document store.
//!
//! Owns the data model (snapshots, ops), the commit contract every backend implements, query
//! validation and tombstone safety, and the cache-aside layer. Concrete engines (PostgreSQL, the
//! in-memory [`MemoryDb`]) only supply I/O.

pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod query;
pub mod traits;
pub mod types;

pub use cache::{cache_key, CacheLayer, MemorySnapshotCache};
pub use config::{CacheConfig, QueryConfig};
pub use error::{Error, QueryError, Result};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use memory::MemoryDb;
pub use query::{prepare_query, QueryPlan};
pub use traits::{OtDb, SnapshotCache};
pub use types::{
    CommitOptions, Operation, Projection, QueryResult, ReadOptions, Snapshot, Version,
};
