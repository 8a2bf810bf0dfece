//! In-memory reference repository
//!
//! Keeps every entry until it is removed, so elapsed entries read back as
//! `Expired` rather than disappearing. Useful as either layer in tests and as
//! a small process-local layer 1.

use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use dashmap::DashMap;
use tracing::debug;

use super::{KeyLock, KeyLocks, Repository, ValueFactory};
use crate::{
    CacheError, CacheKey, CacheValue,
    notify::{Invalidation, LocalNotifications},
};

struct Entry<V> {
    value: CacheValue<V>,
    stored_at: Instant,
}

pub struct MemoryRepository<K: CacheKey, V> {
    entries: DashMap<K, Entry<V>>,
    locks: KeyLocks<K>,
    ttl: Option<Duration>,
    notifications: Option<Arc<LocalNotifications<K>>>,
}

impl<K: CacheKey, V: Send + Sync + 'static> Default for MemoryRepository<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey, V: Send + Sync + 'static> MemoryRepository<K, V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            locks: KeyLocks::new(),
            ttl: None,
            notifications: None,
        }
    }

    /// Repository-level time-to-live, applied on top of each value's own
    /// expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Announce every removal request and every clear through `notifications`.
    pub fn with_notifications(mut self, notifications: Arc<LocalNotifications<K>>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn read(&self, entry: &Entry<V>) -> CacheValue<V> {
        let outlived = self
            .ttl
            .is_some_and(|ttl| entry.stored_at.elapsed() >= ttl);
        if outlived && entry.value.state().is_terminal() {
            return CacheValue::expired();
        }
        entry.value.clone().resolve(SystemTime::now())
    }

    async fn announce(&self, message: Invalidation<K>) -> Result<(), CacheError> {
        match &self.notifications {
            Some(notifications) => notifications.notify(message).await,
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl<K, V> Repository<K, V> for MemoryRepository<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    async fn get_value(&self, key: &K) -> Result<CacheValue<V>, CacheError> {
        Ok(self
            .entries
            .get(key)
            .map_or_else(CacheValue::missing, |entry| self.read(&entry)))
    }

    async fn contains_key(&self, key: &K) -> Result<bool, CacheError> {
        Ok(self.entries.contains_key(key))
    }

    async fn add_or_update(
        &self,
        key: &K,
        factory: &dyn ValueFactory<K, V>,
    ) -> Result<CacheValue<V>, CacheError> {
        let value = factory.create(key).await?;
        self.entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                stored_at: Instant::now(),
            },
        );
        debug!("Memory repository stored {} for key: {}", value.state(), key);
        Ok(value)
    }

    async fn try_remove(&self, key: &K) -> Result<bool, CacheError> {
        let removed = self.entries.remove(key).is_some();
        self.announce(Invalidation::Key(key.clone())).await?;
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        self.announce(Invalidation::All).await
    }

    async fn enumerate(&self) -> Result<Vec<(K, CacheValue<V>)>, CacheError> {
        Ok(self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), self.read(entry.value())))
            .collect())
    }

    async fn sync_lock(&self, key: &K) -> Result<KeyLock, CacheError> {
        Ok(self.locks.acquire(key).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheState, notify::NotificationsProvider};
    use std::sync::Mutex;

    async fn store(repo: &MemoryRepository<String, u32>, key: &str, value: CacheValue<u32>) {
        repo.add_or_update(&key.to_owned(), &move |_: &String| {
            let value = value.clone();
            async move { Ok::<_, CacheError>(value) }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_missing_then_stored() {
        let repo = MemoryRepository::<String, u32>::new();
        let key = "a".to_owned();

        assert_eq!(repo.get_value(&key).await.unwrap().state(), CacheState::Missing);
        assert!(!repo.contains_key(&key).await.unwrap());

        store(&repo, "a", CacheValue::exists(1, None)).await;
        let value = repo.get_value(&key).await.unwrap();
        assert_eq!(value.state(), CacheState::Exists);
        assert_eq!(value.value().map(|v| **v), Some(1));
        assert!(repo.contains_key(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_repository_ttl_reports_expired() {
        let repo = MemoryRepository::<String, u32>::new().with_ttl(Duration::from_millis(20));
        store(&repo, "a", CacheValue::exists(1, None)).await;
        store(&repo, "b", CacheValue::not_found(None)).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        let key = "a".to_owned();
        assert_eq!(repo.get_value(&key).await.unwrap().state(), CacheState::Expired);
        assert_eq!(
            repo.get_value(&"b".to_owned()).await.unwrap().state(),
            CacheState::Expired
        );
        // Expired entries are still recorded
        assert!(repo.contains_key(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_value_expiry_reports_expired() {
        let repo = MemoryRepository::<String, u32>::new();
        store(&repo, "a", CacheValue::exists(1, Some(Duration::from_millis(20)))).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        let listed = repo.enumerate().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.state(), CacheState::Expired);
    }

    #[tokio::test]
    async fn test_clear_leaves_keys_missing() {
        let repo = MemoryRepository::<String, u32>::new();
        store(&repo, "a", CacheValue::exists(1, None)).await;
        store(&repo, "b", CacheValue::exists(2, None)).await;

        repo.clear().await.unwrap();

        assert!(repo.is_empty());
        assert_eq!(
            repo.get_value(&"a".to_owned()).await.unwrap().state(),
            CacheState::Missing
        );
    }

    #[tokio::test]
    async fn test_removals_are_announced() {
        let notifications = Arc::new(LocalNotifications::<String>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            notifications.subscribe(crate::notify::handler(move |message| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(message);
                    Ok(())
                }
            }));
        }
        let repo = MemoryRepository::<String, u32>::new().with_notifications(notifications);
        store(&repo, "a", CacheValue::exists(1, None)).await;

        assert!(repo.try_remove(&"a".to_owned()).await.unwrap());
        assert!(!repo.try_remove(&"a".to_owned()).await.unwrap());
        repo.clear().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Invalidation::Key("a".to_owned()),
                Invalidation::Key("a".to_owned()),
                Invalidation::All,
            ]
        );
    }
}
