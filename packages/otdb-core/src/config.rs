use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Feature flags for query operators that are off (or on) by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Permit raw-code operators (`$where`, `$mapReduce`).
    pub allow_js_queries: bool,
    pub allow_aggregate_queries: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            allow_js_queries: false,
            allow_aggregate_queries: true,
        }
    }
}

/// Settings for the bundled in-process snapshot cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry lifetime in milliseconds. `None` keeps entries until overwritten or invalidated.
    pub ttl_ms: Option<u64>,
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}
