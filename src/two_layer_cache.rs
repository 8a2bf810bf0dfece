//! Two-layer cache orchestrator
//!
//! Composes a fast layer 1 repository and a shared layer 2 repository in front
//! of an authoritative [`DataSource`]:
//! - reads stop at the first layer holding `Exists` or `NotFound`
//! - when both layers miss, the value is populated under layer 2's per-key
//!   lock, then copied into layer 1 under layer 1's lock
//! - removals and clears publish one invalidation per logical change through
//!   the notifications router
//!
//! Lock ordering: any path taking both per-key locks takes layer 2's first.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::{
    CacheConfig, CacheError, CacheKey, CacheState, CacheValue, DataSource, KeyCodec,
    notify::{
        Invalidation, InvalidationHandler, NotificationsProvider, NotificationsRouter, handler,
    },
    repository::{KeyLock, Repository, ValueFactory},
};

/// Loads from the data source, caching misses as negative entries.
struct SourceLoader<'a, K, V> {
    source: &'a dyn DataSource<K, V>,
    ttl: Option<Duration>,
}

#[async_trait::async_trait]
impl<'a, K, V> ValueFactory<K, V> for SourceLoader<'a, K, V>
where
    K: CacheKey,
    V: Send + Sync + 'static,
{
    async fn create(&self, key: &K) -> Result<CacheValue<V>, CacheError> {
        match self.source.try_get_value(key).await? {
            Some(value) => {
                debug!("Fetched from backend for key: {}", key);
                Ok(CacheValue::exists(value, self.ttl))
            }
            None => {
                debug!("Value not found for key: {}", key);
                Ok(CacheValue::not_found(self.ttl))
            }
        }
    }
}

/// Hands back an already-decided value.
struct Preset<V>(CacheValue<V>);

#[async_trait::async_trait]
impl<K, V> ValueFactory<K, V> for Preset<V>
where
    K: Sync,
    V: Send + Sync,
{
    async fn create(&self, _key: &K) -> Result<CacheValue<V>, CacheError> {
        Ok(self.0.clone())
    }
}

/// Removals this cache is issuing against layer 2 right now.
///
/// A layer 2 provider may report these deletions back. The removal path
/// already evicts layer 1 and publishes, so such echoes are dropped.
struct OwnRemovals<K: CacheKey> {
    keys: DashMap<K, usize>,
    clearing: AtomicUsize,
}

impl<K: CacheKey> OwnRemovals<K> {
    fn new() -> Self {
        Self {
            keys: DashMap::new(),
            clearing: AtomicUsize::new(0),
        }
    }

    fn mark(&self, removal: Invalidation<K>) -> OwnRemoval<'_, K> {
        match &removal {
            Invalidation::Key(key) => *self.keys.entry(key.clone()).or_insert(0) += 1,
            Invalidation::All => {
                self.clearing.fetch_add(1, Ordering::SeqCst);
            }
        }
        OwnRemoval {
            removals: self,
            removal,
        }
    }

    fn covers(&self, message: &Invalidation<K>) -> bool {
        if self.clearing.load(Ordering::SeqCst) > 0 {
            return true;
        }
        match message {
            Invalidation::Key(key) => self.keys.contains_key(key),
            Invalidation::All => false,
        }
    }
}

/// Marks one removal as in flight until dropped.
struct OwnRemoval<'a, K: CacheKey> {
    removals: &'a OwnRemovals<K>,
    removal: Invalidation<K>,
}

impl<K: CacheKey> Drop for OwnRemoval<'_, K> {
    fn drop(&mut self) {
        match &self.removal {
            Invalidation::Key(key) => {
                self.removals.keys.remove_if_mut(key, |_, pending| {
                    *pending -= 1;
                    *pending == 0
                });
            }
            Invalidation::All => {
                self.removals.clearing.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

struct Inner<K: CacheKey, V: Send + Sync + 'static> {
    layer1: Arc<dyn Repository<K, V>>,
    layer2: Arc<dyn Repository<K, V>>,
    source: Arc<dyn DataSource<K, V>>,
    codec: Arc<dyn KeyCodec<K>>,
    router: Option<Arc<dyn NotificationsRouter>>,
    /// Layer 1 announces its own removals, which get relayed to the router
    layer1_relays: bool,
    type_tag: String,
    value_ttl: Option<Duration>,
    own_removals: OwnRemovals<K>,
}

impl<K: CacheKey, V: Send + Sync + 'static> Inner<K, V> {
    /// Emit one invalidation onto the router, unless layer 1's relay already
    /// does so.
    async fn publish(&self, message: Invalidation<K>) -> Result<(), CacheError> {
        if self.layer1_relays {
            return Ok(());
        }
        let Some(router) = &self.router else {
            return Ok(());
        };
        let message = message.try_map(|key| self.codec.serialize(&key))?;
        router.publish(&self.type_tag, message).await
    }

    /// Layer 2 dropped something out of band: evict it from layer 1 too.
    async fn on_layer2_invalidation(&self, message: Invalidation<K>) -> Result<(), CacheError> {
        if self.own_removals.covers(&message) {
            debug!("Layer 2 echoed a removal issued by cache {}", self.type_tag);
            return Ok(());
        }
        match &message {
            Invalidation::Key(key) => {
                debug!("Layer 2 invalidated key: {}", key);
                self.layer1.try_remove(key).await?;
            }
            Invalidation::All => {
                debug!("Layer 2 invalidated all keys");
                self.layer1.clear().await?;
            }
        }
        self.publish(message).await
    }

    /// Forward a layer 1 removal onto the router.
    async fn relay_layer1_invalidation(&self, message: Invalidation<K>) -> Result<(), CacheError> {
        let Some(router) = &self.router else {
            return Ok(());
        };
        let message = message.try_map(|key| self.codec.serialize(&key))?;
        router.publish(&self.type_tag, message).await
    }
}

/// Handler that runs `f` against the cache internals while they are alive.
fn weak_handler<K, V, F, Fut>(inner: &Arc<Inner<K, V>>, f: F) -> InvalidationHandler<K>
where
    K: CacheKey,
    V: Send + Sync + 'static,
    F: Fn(Arc<Inner<K, V>>, Invalidation<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CacheError>> + Send + 'static,
{
    let weak: Weak<Inner<K, V>> = Arc::downgrade(inner);
    Arc::new(move |message: Invalidation<K>| match weak.upgrade() {
        Some(inner) => f(inner, message).boxed(),
        None => futures::future::ready(Ok(())).boxed(),
    })
}

/// Two-layer read-through cache.
///
/// Cloning is cheap and clones share all collaborators. Build one with
/// [`TwoLayerCache::builder`].
pub struct TwoLayerCache<K: CacheKey, V: Send + Sync + 'static> {
    inner: Arc<Inner<K, V>>,
}

impl<K: CacheKey, V: Send + Sync + 'static> Clone for TwoLayerCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: Send + Sync + 'static> TwoLayerCache<K, V> {
    pub fn builder() -> TwoLayerCacheBuilder<K, V> {
        TwoLayerCacheBuilder::new()
    }

    /// Tag addressing this cache's invalidations on the router
    pub fn type_tag(&self) -> &str {
        &self.inner.type_tag
    }

    /// Read without populating.
    ///
    /// Returns layer 1's value when it is `Exists` or `NotFound`, otherwise
    /// layer 2's value as is. Layer 1 is not refreshed from layer 2 here.
    pub async fn get_value(&self, key: &K) -> Result<CacheValue<V>, CacheError> {
        let value = self.inner.layer1.get_value(key).await?;
        match value.state() {
            CacheState::Exists | CacheState::NotFound => {
                debug!("Cache hit L1 for key: {}", key);
                Ok(value)
            }
            CacheState::Expired | CacheState::Missing => {
                debug!("Cache miss L1 for key: {} ({})", key, value.state());
                self.inner.layer2.get_value(key).await
            }
        }
    }

    /// Read, populating both layers from `factory` when both miss.
    ///
    /// Under contention the factory runs once per key: racing callers wait on
    /// layer 2's lock and then pick up the winner's value.
    pub async fn get_or_add(
        &self,
        key: &K,
        factory: &dyn ValueFactory<K, V>,
    ) -> Result<CacheValue<V>, CacheError> {
        let value = self.get_value(key).await?;
        match value.state() {
            CacheState::Exists | CacheState::NotFound => Ok(value),
            CacheState::Expired | CacheState::Missing => {
                debug!("Cache miss L2 for key: {} ({})", key, value.state());
                self.populate(key, factory).await
            }
        }
    }

    /// [`get_or_add`](Self::get_or_add) with the data source as factory.
    ///
    /// Hits are stored as `Exists`, misses as `NotFound`, both expiring after
    /// the configured `value_ttl`.
    pub async fn get_or_load(&self, key: &K) -> Result<CacheValue<V>, CacheError> {
        let loader = SourceLoader {
            source: self.inner.source.as_ref(),
            ttl: self.inner.value_ttl,
        };
        self.get_or_add(key, &loader).await
    }

    async fn populate(
        &self,
        key: &K,
        factory: &dyn ValueFactory<K, V>,
    ) -> Result<CacheValue<V>, CacheError> {
        let _layer2_lock = self.inner.layer2.sync_lock(key).await?;

        // Another caller may have populated while we waited
        let current = self.inner.layer2.get_value(key).await?;
        let value = match current.state() {
            CacheState::Exists | CacheState::NotFound => {
                debug!("L2 populated concurrently for key: {}", key);
                current
            }
            CacheState::Expired | CacheState::Missing => {
                self.inner.layer2.add_or_update(key, factory).await?
            }
        };

        let _layer1_lock = self.inner.layer1.sync_lock(key).await?;
        // Overwrite whatever layer 1 holds so every racer converges on one value
        self.inner
            .layer1
            .add_or_update(key, &Preset(value.clone()))
            .await?;

        Ok(value)
    }

    /// Advisory only: not lock protected.
    pub async fn contains_key(&self, key: &K) -> Result<bool, CacheError> {
        Ok(self.inner.layer1.contains_key(key).await?
            || self.inner.layer2.contains_key(key).await?)
    }

    /// Remove `key` from both layers and publish its invalidation, whether or
    /// not anything was removed.
    pub async fn try_remove(&self, key: &K) -> Result<bool, CacheError> {
        debug!("Invalidating cache for key: {}", key);
        let removed_l2 = {
            let _own = self.inner.own_removals.mark(Invalidation::Key(key.clone()));
            self.inner.layer2.try_remove(key).await?
        };
        let removed_l1 = self.inner.layer1.try_remove(key).await?;
        self.inner.publish(Invalidation::Key(key.clone())).await?;
        Ok(removed_l2 || removed_l1)
    }

    /// Empty both layers and publish a clear-all invalidation.
    pub async fn clear(&self) -> Result<(), CacheError> {
        debug!("Clearing cache {}", self.inner.type_tag);
        {
            let _own = self.inner.own_removals.mark(Invalidation::All);
            self.inner.layer2.clear().await?;
        }
        self.inner.layer1.clear().await?;
        self.inner.publish(Invalidation::All).await
    }

    /// Entries of layer 2.
    ///
    /// Layer 1 only holds what this process has read, so it is never
    /// consulted.
    pub async fn enumerate(&self) -> Result<Vec<(K, CacheValue<V>)>, CacheError> {
        self.inner.layer2.enumerate().await
    }

    /// Register for invalidations of this cache's keys arriving on the router.
    pub fn subscribe(&self, on_invalidation: InvalidationHandler<K>) -> Result<(), CacheError> {
        let Some(router) = &self.inner.router else {
            return Err(CacheError::Configuration(
                "subscribing requires a notifications router",
            ));
        };
        let codec = Arc::clone(&self.inner.codec);
        let type_tag = self.inner.type_tag.clone();
        router.subscribe(
            &self.inner.type_tag,
            handler(move |message: Invalidation<String>| {
                let decoded = message.try_map(|raw| codec.deserialize(&raw));
                let on_invalidation = Arc::clone(&on_invalidation);
                let type_tag = type_tag.clone();
                async move {
                    match decoded {
                        Ok(message) => on_invalidation(message).await,
                        Err(e) => {
                            warn!("Unable to decode invalidation for {}: {}", type_tag, e);
                            Err(e)
                        }
                    }
                }
            }),
        );
        Ok(())
    }

    /// The orchestrator guards no state of its own; real exclusion lives in
    /// the repositories.
    pub fn sync_lock(&self, _key: &K) -> KeyLock {
        KeyLock::noop()
    }
}

/// Builder for [`TwoLayerCache`].
///
/// Layer 1, layer 2, the data source and the key codec are required; the
/// router and both notification providers are optional.
pub struct TwoLayerCacheBuilder<K: CacheKey, V: Send + Sync + 'static> {
    layer1: Option<Arc<dyn Repository<K, V>>>,
    layer2: Option<Arc<dyn Repository<K, V>>>,
    source: Option<Arc<dyn DataSource<K, V>>>,
    codec: Option<Arc<dyn KeyCodec<K>>>,
    router: Option<Arc<dyn NotificationsRouter>>,
    layer1_notifications: Option<Arc<dyn NotificationsProvider<K>>>,
    layer2_notifications: Option<Arc<dyn NotificationsProvider<K>>>,
    type_tag: Option<String>,
    config: CacheConfig,
}

impl<K: CacheKey, V: Send + Sync + 'static> Default for TwoLayerCacheBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CacheKey, V: Send + Sync + 'static> TwoLayerCacheBuilder<K, V> {
    pub fn new() -> Self {
        Self {
            layer1: None,
            layer2: None,
            source: None,
            codec: None,
            router: None,
            layer1_notifications: None,
            layer2_notifications: None,
            type_tag: None,
            config: CacheConfig::default(),
        }
    }

    pub fn layer1(mut self, repository: Arc<dyn Repository<K, V>>) -> Self {
        self.layer1 = Some(repository);
        self
    }

    pub fn layer2(mut self, repository: Arc<dyn Repository<K, V>>) -> Self {
        self.layer2 = Some(repository);
        self
    }

    pub fn data_source(mut self, source: Arc<dyn DataSource<K, V>>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn KeyCodec<K>>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn router(mut self, router: Arc<dyn NotificationsRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Source of layer 1's own removals, relayed onto the router.
    pub fn layer1_notifications(mut self, provider: Arc<dyn NotificationsProvider<K>>) -> Self {
        self.layer1_notifications = Some(provider);
        self
    }

    /// Source of out-of-band layer 2 removals, mirrored into layer 1.
    pub fn layer2_notifications(mut self, provider: Arc<dyn NotificationsProvider<K>>) -> Self {
        self.layer2_notifications = Some(provider);
        self
    }

    /// Router address for this cache; defaults to the key and value type names.
    pub fn type_tag(mut self, type_tag: impl Into<String>) -> Self {
        self.type_tag = Some(type_tag.into());
        self
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate collaborators and install the notification subscriptions.
    pub fn build(self) -> Result<TwoLayerCache<K, V>, CacheError> {
        let codec = self
            .codec
            .ok_or(CacheError::Configuration("a key codec is required"))?;
        let layer1 = self
            .layer1
            .ok_or(CacheError::Configuration("a layer 1 repository is required"))?;
        let layer2 = self
            .layer2
            .ok_or(CacheError::Configuration("a layer 2 repository is required"))?;
        let source = self
            .source
            .ok_or(CacheError::Configuration("a data source is required"))?;

        let inner = Arc::new(Inner {
            layer1,
            layer2,
            source,
            codec,
            router: self.router,
            layer1_relays: self.layer1_notifications.is_some(),
            type_tag: self
                .type_tag
                .unwrap_or_else(|| std::any::type_name::<(K, V)>().to_owned()),
            value_ttl: self.config.value_ttl,
            own_removals: OwnRemovals::new(),
        });

        if let Some(provider) = &self.layer2_notifications {
            provider.subscribe(weak_handler(&inner, |inner, message| async move {
                inner.on_layer2_invalidation(message).await
            }));
        }

        if let Some(provider) = &self.layer1_notifications
            && inner.router.is_some()
        {
            provider.subscribe(weak_handler(&inner, |inner, message| async move {
                inner.relay_layer1_invalidation(message).await
            }));
        }

        debug!(
            "Two-layer cache {} ready (router: {}, layer 1 relay: {})",
            inner.type_tag,
            inner.router.is_some(),
            inner.layer1_relays
        );

        Ok(TwoLayerCache { inner })
    }
}
