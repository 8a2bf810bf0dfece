//! Invalidation notifications
//!
//! Two kinds of publish/subscribe facilities keep layer 1 in step with the
//! rest of the fleet:
//! - a [`NotificationsProvider`] is a local source of invalidations for one
//!   layer, typed by that layer's key
//! - a [`NotificationsRouter`] is the shared bus, addressed by a type tag and
//!   a serialized key, so caches of different key/value types can share it

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};

use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::CacheError;

mod redis_router;

pub use redis_router::{PubSubHub, RedisKeyspaceNotifications, RedisRouter};

/// A single invalidation event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum Invalidation<K> {
    /// One key is no longer valid
    Key(K),
    /// Every key of the cache is no longer valid
    All,
}

impl<K> Invalidation<K> {
    pub fn map<T>(self, f: impl FnOnce(K) -> T) -> Invalidation<T> {
        match self {
            Invalidation::Key(key) => Invalidation::Key(f(key)),
            Invalidation::All => Invalidation::All,
        }
    }

    pub fn try_map<T, E>(self, f: impl FnOnce(K) -> Result<T, E>) -> Result<Invalidation<T>, E> {
        Ok(match self {
            Invalidation::Key(key) => Invalidation::Key(f(key)?),
            Invalidation::All => Invalidation::All,
        })
    }

    pub fn key(&self) -> Option<&K> {
        match self {
            Invalidation::Key(key) => Some(key),
            Invalidation::All => None,
        }
    }
}

/// Async callback invoked for each delivered invalidation
pub type InvalidationHandler<K> =
    Arc<dyn Fn(Invalidation<K>) -> BoxFuture<'static, Result<(), CacheError>> + Send + Sync>;

/// Wrap an async closure as an [`InvalidationHandler`].
pub fn handler<K, F, Fut>(f: F) -> InvalidationHandler<K>
where
    F: Fn(Invalidation<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CacheError>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Local source of invalidations for a single layer.
///
/// Fires when the layer drops a key through means other than the
/// orchestrator's read path, for example another process deleting a shared
/// entry. Subscriptions last as long as the provider.
pub trait NotificationsProvider<K>: Send + Sync {
    fn subscribe(&self, handler: InvalidationHandler<K>);
}

/// Shared invalidation bus, multiplexed by type tag.
#[async_trait::async_trait]
pub trait NotificationsRouter: Send + Sync {
    async fn publish(&self, type_tag: &str, message: Invalidation<String>)
    -> Result<(), CacheError>;

    fn subscribe(&self, type_tag: &str, handler: InvalidationHandler<String>);
}

/// Run every handler, then report the first failure.
async fn deliver<K: Clone>(
    handlers: Vec<InvalidationHandler<K>>,
    message: Invalidation<K>,
) -> Result<(), CacheError> {
    let mut first_error = None;
    for handler in handlers {
        if let Err(e) = handler(message.clone()).await {
            warn!("Invalidation handler failed: {}", e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// In-process notifications provider.
///
/// Repositories hold one and call [`LocalNotifications::notify`] when they
/// drop keys; tests use it to simulate out-of-band changes.
pub struct LocalNotifications<K> {
    handlers: RwLock<Vec<InvalidationHandler<K>>>,
}

impl<K> Default for LocalNotifications<K> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<K: Clone + Send + Sync + 'static> LocalNotifications<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to every subscriber, awaiting each in turn.
    pub async fn notify(&self, message: Invalidation<K>) -> Result<(), CacheError> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        deliver(handlers, message).await
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<K: Clone + Send + Sync + 'static> NotificationsProvider<K> for LocalNotifications<K> {
    fn subscribe(&self, handler: InvalidationHandler<K>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }
}

/// In-process router: a map from type tag to that tag's subscribers.
#[derive(Default)]
pub struct LocalRouter {
    topics: RwLock<HashMap<String, Vec<InvalidationHandler<String>>>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl NotificationsRouter for LocalRouter {
    async fn publish(
        &self,
        type_tag: &str,
        message: Invalidation<String>,
    ) -> Result<(), CacheError> {
        let handlers = self
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_tag)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!("No listeners for type tag {}", type_tag);
            return Ok(());
        }
        deliver(handlers, message).await
    }

    fn subscribe(&self, type_tag: &str, handler: InvalidationHandler<String>) {
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(type_tag.to_owned())
            .or_default()
            .push(handler);
    }
}
