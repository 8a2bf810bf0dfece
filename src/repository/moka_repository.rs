//! Layer 1 repository on an in-memory Moka cache

use std::{sync::Arc, time::SystemTime};

use moka::future::Cache;
use tracing::debug;

use super::{KeyLock, KeyLocks, Repository, ValueFactory};
use crate::{
    CacheConfig, CacheError, CacheKey, CacheValue,
    notify::{Invalidation, LocalNotifications},
};

/// Bounded process-local repository.
///
/// Capacity and retention come from [`CacheConfig`]; entries Moka evicts read
/// back as `Missing`, entries past their own expiry read back as `Expired`.
pub struct MokaRepository<K: CacheKey, V: Send + Sync + 'static> {
    cache: Cache<K, CacheValue<V>>,
    locks: KeyLocks<K>,
    notifications: Option<Arc<LocalNotifications<K>>>,
}

impl<K: CacheKey, V: Send + Sync + 'static> MokaRepository<K, V> {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.l1_max_capacity)
            .time_to_live(config.l1_ttl)
            .build();

        Self {
            cache,
            locks: KeyLocks::new(),
            notifications: None,
        }
    }

    /// Announce every removal request and every clear through `notifications`.
    pub fn with_notifications(mut self, notifications: Arc<LocalNotifications<K>>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    async fn announce(&self, message: Invalidation<K>) -> Result<(), CacheError> {
        match &self.notifications {
            Some(notifications) => notifications.notify(message).await,
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl<K, V> Repository<K, V> for MokaRepository<K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    async fn get_value(&self, key: &K) -> Result<CacheValue<V>, CacheError> {
        Ok(match self.cache.get(key).await {
            Some(value) => value.resolve(SystemTime::now()),
            None => CacheValue::missing(),
        })
    }

    async fn contains_key(&self, key: &K) -> Result<bool, CacheError> {
        Ok(self.cache.contains_key(key))
    }

    async fn add_or_update(
        &self,
        key: &K,
        factory: &dyn ValueFactory<K, V>,
    ) -> Result<CacheValue<V>, CacheError> {
        let value = factory.create(key).await?;
        self.cache.insert(key.clone(), value.clone()).await;
        debug!("L1 stored {} for key: {}", value.state(), key);
        Ok(value)
    }

    async fn try_remove(&self, key: &K) -> Result<bool, CacheError> {
        let removed = self.cache.remove(key).await.is_some();
        debug!("L1 cache invalidated for key: {}", key);
        self.announce(Invalidation::Key(key.clone())).await?;
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.cache.invalidate_all();
        self.announce(Invalidation::All).await
    }

    async fn enumerate(&self) -> Result<Vec<(K, CacheValue<V>)>, CacheError> {
        let now = SystemTime::now();
        Ok(self
            .cache
            .iter()
            .map(|(key, value)| ((*key).clone(), value.resolve(now)))
            .collect())
    }

    async fn sync_lock(&self, key: &K) -> Result<KeyLock, CacheError> {
        Ok(self.locks.acquire(key).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheState;
    use std::time::Duration;

    fn repo() -> MokaRepository<String, String> {
        MokaRepository::new(&CacheConfig::default())
    }

    async fn store(repo: &MokaRepository<String, String>, key: &str, value: CacheValue<String>) {
        repo.add_or_update(&key.to_owned(), &move |_: &String| {
            let value = value.clone();
            async move { Ok::<_, CacheError>(value) }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_get_insert_remove() {
        let repo = repo();
        let key = "tenant".to_owned();
        assert_eq!(repo.get_value(&key).await.unwrap().state(), CacheState::Missing);

        store(&repo, "tenant", CacheValue::exists("acme".to_owned(), None)).await;
        let value = repo.get_value(&key).await.unwrap();
        assert_eq!(value.value().map(|v| v.as_str()), Some("acme"));
        assert!(repo.contains_key(&key).await.unwrap());

        assert!(repo.try_remove(&key).await.unwrap());
        assert!(!repo.try_remove(&key).await.unwrap());
        assert_eq!(repo.get_value(&key).await.unwrap().state(), CacheState::Missing);
    }

    #[tokio::test]
    async fn test_elapsed_value_reads_expired() {
        let repo = repo();
        store(
            &repo,
            "short",
            CacheValue::exists("x".to_owned(), Some(Duration::from_millis(20))),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(
            repo.get_value(&"short".to_owned()).await.unwrap().state(),
            CacheState::Expired
        );
    }

    #[tokio::test]
    async fn test_clear_and_enumerate() {
        let repo = repo();
        store(&repo, "a", CacheValue::exists("1".to_owned(), None)).await;
        store(&repo, "b", CacheValue::not_found(None)).await;

        let mut listed: Vec<_> = repo
            .enumerate()
            .await
            .unwrap()
            .into_iter()
            .map(|(key, value)| (key, value.state()))
            .collect();
        listed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            listed,
            vec![
                ("a".to_owned(), CacheState::Exists),
                ("b".to_owned(), CacheState::NotFound),
            ]
        );

        repo.clear().await.unwrap();
        assert_eq!(
            repo.get_value(&"a".to_owned()).await.unwrap().state(),
            CacheState::Missing
        );
    }
}
