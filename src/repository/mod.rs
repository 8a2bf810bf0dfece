//! Repository contract shared by both cache layers
//!
//! A repository owns a mapping from key to [`CacheValue`] plus a registry of
//! per-key locks. Layer 1 and layer 2 are independent repositories; the
//! orchestrator only ever reaches their storage through this trait.

use std::{future::Future, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{CacheError, CacheKey, CacheValue};

mod memory;
mod moka_repository;
mod redis_repository;

pub use memory::MemoryRepository;
pub use moka_repository::MokaRepository;
pub use redis_repository::RedisRepository;

/// Strategy producing the value to store for a key.
///
/// A factory should be idempotent and free of side effects beyond the lookup
/// it performs: repositories call it at most once per `add_or_update`, but
/// racing callers may each run their own factory when no lock is held.
#[async_trait::async_trait]
pub trait ValueFactory<K, V>: Send + Sync {
    async fn create(&self, key: &K) -> Result<CacheValue<V>, CacheError>;
}

#[async_trait::async_trait]
impl<K, V, F, Fut> ValueFactory<K, V> for F
where
    K: Sync,
    F: Fn(&K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CacheValue<V>, CacheError>> + Send,
{
    async fn create(&self, key: &K) -> Result<CacheValue<V>, CacheError> {
        (self)(key).await
    }
}

/// Trait implemented by every cache layer
#[async_trait::async_trait]
pub trait Repository<K, V>: Send + Sync
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    /// Current value for `key`; `Missing` when nothing was recorded and
    /// `Expired` when a recorded entry outlived its time-to-live.
    async fn get_value(&self, key: &K) -> Result<CacheValue<V>, CacheError>;

    async fn contains_key(&self, key: &K) -> Result<bool, CacheError>;

    /// Store the factory's result for `key`, replacing any previous entry,
    /// and return what was stored. Must not take the key's `sync_lock`.
    async fn add_or_update(
        &self,
        key: &K,
        factory: &dyn ValueFactory<K, V>,
    ) -> Result<CacheValue<V>, CacheError>;

    /// Remove `key`, returning whether an entry was present.
    async fn try_remove(&self, key: &K) -> Result<bool, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    /// Snapshot of every entry currently held.
    async fn enumerate(&self) -> Result<Vec<(K, CacheValue<V>)>, CacheError>;

    /// Exclusive per-key lock, released when the returned handle is dropped.
    async fn sync_lock(&self, key: &K) -> Result<KeyLock, CacheError>;
}

/// Scoped lock handle.
///
/// Dropping the handle releases the lock on every exit path, including early
/// returns through `?` and unwinding.
#[must_use = "the lock is released as soon as the handle is dropped"]
pub struct KeyLock {
    guard: Option<OwnedMutexGuard<()>>,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl KeyLock {
    /// A handle that guards nothing.
    pub fn noop() -> Self {
        Self {
            guard: None,
            on_release: None,
        }
    }

    fn held(guard: OwnedMutexGuard<()>, on_release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            guard: Some(guard),
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.guard.is_none()
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        // Release before cleanup so the registry sees the mutex as idle
        drop(self.guard.take());
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

/// Registry of per-key async mutexes.
///
/// Entries are created on demand and pruned once the last holder or waiter
/// releases them.
pub struct KeyLocks<K: CacheKey> {
    locks: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K: CacheKey> Default for KeyLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey> KeyLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &K) -> KeyLock {
        let mutex = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let guard = mutex.lock_owned().await;

        let locks = Arc::clone(&self.locks);
        let key = key.clone();
        KeyLock::held(guard, move || {
            // Only the registry's own reference left means nobody is waiting
            locks.remove_if(&key, |_, m| Arc::strong_count(m) == 1);
        })
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
