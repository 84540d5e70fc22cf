use std::time::Duration;

use serde::{Deserialize, Serialize};

use otdb_core::{CacheConfig, QueryConfig};

pub const DEFAULT_POOL_SIZE: usize = 10;

/// Connection and behaviour settings for [`crate::PostgresDb`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgConfig {
    /// libpq-style connection string or `postgres://` URL.
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// How long `get()` on an exhausted pool waits before failing. `None` waits forever.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
    #[serde(default)]
    pub query: QueryConfig,
    /// Enables the bundled in-process snapshot cache.
    #[serde(default)]
    pub cache: Option<CacheConfig>,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl PgConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: DEFAULT_POOL_SIZE,
            acquire_timeout_ms: None,
            query: QueryConfig::default(),
            cache: None,
        }
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn query_config(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub(crate) fn acquire_timeout_duration(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}
