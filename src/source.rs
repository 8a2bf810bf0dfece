//! Authoritative data source behind the cache layers

/// Error type returned by data source lookups
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for fetching authoritative values when both cache layers miss.
///
/// Implementations wrap a database, a remote API or anything else that owns
/// the data. `Ok(None)` means the key does not exist and is cached as a
/// negative entry; errors are handed back to the caller untouched.
#[async_trait::async_trait]
pub trait DataSource<K, V>: Send + Sync {
    /// Fetch a value from the backend by key
    async fn try_get_value(&self, key: &K) -> Result<Option<V>, BoxError>;
}
