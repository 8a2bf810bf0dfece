//! Redis-backed notifications
//!
//! A [`PubSubHub`] owns one Redis pub/sub connection and fans incoming
//! messages out to registered callbacks. On top of it sit:
//! - [`RedisRouter`], the shared invalidation bus (one channel per type tag)
//! - [`RedisKeyspaceNotifications`], a layer 2 provider fed by Redis keyspace
//!   events on the layer's keys

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{FutureExt, StreamExt, future::BoxFuture};
use redis::AsyncCommands;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};

use super::{Invalidation, InvalidationHandler, NotificationsProvider, NotificationsRouter};
use crate::{CacheError, KeyCodec};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Keyspace events for entries Redis dropped on its own. `del` and `unlink`
/// come from callers, and the caches issuing them publish those removals.
const INVALIDATING_EVENTS: [&str; 2] = ["expired", "evicted"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Topic {
    Channel(String),
    Pattern(String),
}

struct HubMessage {
    channel: String,
    payload: String,
}

type Callback = Arc<dyn Fn(HubMessage) -> BoxFuture<'static, ()> + Send + Sync>;

enum ControlMsg {
    Register { topic: Topic, callback: Callback },
}

/// Shared hub for Redis pub/sub using a single connection that can subscribe
/// to multiple channels and patterns. Routers and providers register
/// callbacks for their own topics.
pub struct PubSubHub {
    tx: mpsc::UnboundedSender<ControlMsg>,
    handle: JoinHandle<()>,
}

impl Drop for PubSubHub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl PubSubHub {
    /// Start the hub task on the current tokio runtime
    pub fn start(redis_client: redis::Client) -> PubSubHub {
        let (tx, rx) = mpsc::unbounded_channel::<ControlMsg>();
        let handle = tokio::spawn(run_hub(redis_client, rx));
        PubSubHub { tx, handle }
    }

    fn register(&self, topic: Topic, callback: Callback) {
        if self
            .tx
            .send(ControlMsg::Register { topic, callback })
            .is_err()
        {
            error!("PubSubHub: hub task has stopped; registration dropped");
        }
    }
}

async fn subscribe_topic(pubsub: &mut redis::aio::PubSub, topic: &Topic) -> redis::RedisResult<()> {
    match topic {
        Topic::Channel(channel) => pubsub.subscribe(channel).await,
        Topic::Pattern(pattern) => pubsub.psubscribe(pattern).await,
    }
}

async fn next_message(pubsub: &mut redis::aio::PubSub) -> Option<redis::Msg> {
    pubsub.on_message().next().await
}

async fn dispatch(callbacks: &HashMap<Topic, Vec<Callback>>, msg: redis::Msg) {
    let topic = if msg.from_pattern() {
        match msg.get_pattern::<String>() {
            Ok(pattern) => Topic::Pattern(pattern),
            Err(e) => {
                warn!("PubSubHub: failed to decode pattern: {}", e);
                return;
            }
        }
    } else {
        Topic::Channel(msg.get_channel_name().to_owned())
    };

    let payload = match msg.get_payload::<String>() {
        Ok(payload) => payload,
        Err(e) => {
            warn!("PubSubHub: failed to decode pub/sub payload: {}", e);
            return;
        }
    };

    let Some(listeners) = callbacks.get(&topic) else {
        debug!("PubSubHub: no listeners for {:?}", topic);
        return;
    };
    for cb in listeners {
        cb(HubMessage {
            channel: msg.get_channel_name().to_owned(),
            payload: payload.clone(),
        })
        .await;
    }
}

async fn run_hub(redis_client: redis::Client, mut rx: mpsc::UnboundedReceiver<ControlMsg>) {
    let mut callbacks: HashMap<Topic, Vec<Callback>> = HashMap::new();
    let mut delay = INITIAL_RETRY_DELAY;

    loop {
        let mut pubsub = match redis_client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                error!("PubSubHub: failed to create Redis pubsub connection: {}", e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
                continue;
            }
        };

        // A fresh connection has no subscriptions
        let mut resubscribed = true;
        for topic in callbacks.keys() {
            if let Err(e) = subscribe_topic(&mut pubsub, topic).await {
                warn!("PubSubHub: failed to re-subscribe to {:?}: {}", topic, e);
                resubscribed = false;
                break;
            }
            debug!("PubSubHub: subscribed to {:?}", topic);
        }
        if !resubscribed {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
            continue;
        }
        delay = INITIAL_RETRY_DELAY;

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(ControlMsg::Register { topic, callback }) = cmd else {
                        debug!("PubSubHub: all handles dropped, stopping");
                        return;
                    };
                    let listeners = callbacks.entry(topic.clone()).or_default();
                    listeners.push(callback);
                    if listeners.len() == 1 {
                        if let Err(e) = subscribe_topic(&mut pubsub, &topic).await {
                            warn!("PubSubHub: subscribe failed for {:?}: {}; reconnecting", topic, e);
                            break;
                        }
                        debug!("PubSubHub: subscribed to {:?}", topic);
                    }
                }
                msg = next_message(&mut pubsub) => {
                    match msg {
                        Some(msg) => dispatch(&callbacks, msg).await,
                        None => {
                            warn!("PubSubHub: pub/sub stream closed; reconnecting");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Invalidation bus over Redis pub/sub.
///
/// Each type tag maps to channel `channel_prefix + type_tag`; payloads are
/// JSON-encoded [`Invalidation`] values.
pub struct RedisRouter {
    hub: Arc<PubSubHub>,
    publisher: redis::aio::ConnectionManager,
    channel_prefix: String,
}

impl RedisRouter {
    pub async fn new(
        redis_client: redis::Client,
        channel_prefix: impl Into<String>,
    ) -> Result<Self, CacheError> {
        let publisher = redis::aio::ConnectionManager::new(redis_client.clone()).await?;
        Ok(Self {
            hub: Arc::new(PubSubHub::start(redis_client)),
            publisher,
            channel_prefix: channel_prefix.into(),
        })
    }

    /// The hub, for sharing its connection with keyspace providers
    pub fn hub(&self) -> Arc<PubSubHub> {
        Arc::clone(&self.hub)
    }

    fn channel(&self, type_tag: &str) -> String {
        format!("{}{}", self.channel_prefix, type_tag)
    }
}

#[async_trait::async_trait]
impl NotificationsRouter for RedisRouter {
    async fn publish(
        &self,
        type_tag: &str,
        message: Invalidation<String>,
    ) -> Result<(), CacheError> {
        let channel = self.channel(type_tag);
        let payload = serde_json::to_string(&message)?;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(&channel, &payload).await?;
        debug!(
            "Cache invalidation published on channel '{}': {}",
            channel, payload
        );
        Ok(())
    }

    fn subscribe(&self, type_tag: &str, handler: InvalidationHandler<String>) {
        let channel = self.channel(type_tag);
        let callback: Callback = Arc::new(move |msg: HubMessage| {
            let handler = Arc::clone(&handler);
            async move {
                match serde_json::from_str::<Invalidation<String>>(&msg.payload) {
                    Ok(message) => {
                        if let Err(e) = handler(message).await {
                            warn!(
                                "Invalidation handler failed on channel '{}': {}",
                                msg.channel, e
                            );
                        }
                    }
                    Err(e) => warn!(
                        "Unable to parse invalidation payload on channel '{}': {} ({})",
                        msg.channel, msg.payload, e
                    ),
                }
            }
            .boxed()
        });
        self.hub.register(Topic::Channel(channel), callback);
    }
}

/// Layer 2 notifications provider fed by Redis keyspace events.
///
/// Watches `__keyspace@<db>__:<key_prefix>*` and reports expired and evicted
/// keys. The server must publish keyspace events for expiry and eviction
/// (`notify-keyspace-events` containing `Kxe`).
pub struct RedisKeyspaceNotifications<K> {
    hub: Arc<PubSubHub>,
    channel_prefix: String,
    codec: Arc<dyn KeyCodec<K>>,
}

impl<K> RedisKeyspaceNotifications<K> {
    pub fn new(
        hub: Arc<PubSubHub>,
        database: i64,
        key_prefix: &str,
        codec: Arc<dyn KeyCodec<K>>,
    ) -> Self {
        Self {
            hub,
            channel_prefix: format!("__keyspace@{}__:{}", database, key_prefix),
            codec,
        }
    }

    fn pattern(&self) -> String {
        format!("{}*", self.channel_prefix)
    }
}

/// Extract the serialized cache key from a keyspace event, if the event
/// removed the entry.
fn removed_key<'a>(channel_prefix: &str, channel: &'a str, event: &str) -> Option<&'a str> {
    if !INVALIDATING_EVENTS.contains(&event) {
        return None;
    }
    channel.strip_prefix(channel_prefix)
}

impl<K: Send + Sync + 'static> NotificationsProvider<K> for RedisKeyspaceNotifications<K> {
    fn subscribe(&self, handler: InvalidationHandler<K>) {
        let channel_prefix = self.channel_prefix.clone();
        let codec = Arc::clone(&self.codec);
        let callback: Callback = Arc::new(move |msg: HubMessage| {
            let parsed = removed_key(&channel_prefix, &msg.channel, &msg.payload)
                .map(|raw| codec.deserialize(raw));
            let handler = Arc::clone(&handler);
            async move {
                match parsed {
                    None => {}
                    Some(Ok(key)) => {
                        if let Err(e) = handler(Invalidation::Key(key)).await {
                            warn!("Keyspace invalidation handler failed: {}", e);
                        }
                    }
                    Some(Err(e)) => warn!(
                        "Unable to parse keyspace channel into cache key: {} ({})",
                        msg.channel, e
                    ),
                }
            }
            .boxed()
        });
        self.hub.register(Topic::Pattern(self.pattern()), callback);
    }
}
