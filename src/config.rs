//! Cache configuration

use std::time::Duration;

/// Configuration for the two-layer cache and its stock repositories
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the Moka layer 1
    pub l1_max_capacity: u64,
    /// Retention time for Moka layer 1 entries
    pub l1_ttl: Duration,
    /// Retention time for Redis layer 2 entries
    pub l2_ttl: Duration,
    /// Time-to-live stamped on values produced by `get_or_load`, both found
    /// and not-found. `None` keeps loaded values until evicted.
    pub value_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_capacity: 1000,
            l1_ttl: Duration::from_secs(300), // 5 minutes
            l2_ttl: Duration::from_secs(900), // 15 minutes
            value_ttl: Some(Duration::from_secs(300)),
        }
    }
}
