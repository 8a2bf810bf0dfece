//! Layer 2 repository on Redis
//!
//! Entries live under `key_prefix + codec.serialize(key)` as JSON documents
//! holding the state tag, the payload and the absolute expiry in unix
//! milliseconds. Redis retention (`l2_ttl`) is independent of a value's own
//! expiry, so an entry can read back as `Expired` before Redis drops it.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{KeyLock, KeyLocks, Repository, ValueFactory};
use crate::{CacheConfig, CacheError, CacheKey, CacheState, CacheValue, Cacheable, KeyCodec};

const SCAN_BATCH: usize = 200;

#[derive(Serialize)]
struct StoredValueRef<'a, V> {
    state: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a V>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

#[derive(Deserialize)]
struct StoredValue<V> {
    state: u8,
    payload: Option<V>,
    expires_at_ms: Option<u64>,
}

fn encode<V: Serialize>(value: &CacheValue<V>) -> Result<String, CacheError> {
    let expires_at_ms = value
        .expires_at()
        .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64);
    let stored = StoredValueRef {
        state: value.state().into(),
        payload: value.value().map(|v| v.as_ref()),
        expires_at_ms,
    };
    Ok(serde_json::to_string(&stored)?)
}

/// Decode a stored document.
///
/// An unknown state tag is an error; a document that cannot be read at all,
/// or claims `Exists` without a payload, yields `Ok(None)`.
fn decode<V: Cacheable>(json: &str) -> Result<Option<CacheValue<V>>, CacheError> {
    let stored: StoredValue<V> = match serde_json::from_str(json) {
        Ok(stored) => stored,
        Err(e) => {
            debug!("Undecodable L2 document: {}", e);
            return Ok(None);
        }
    };
    let state = CacheState::try_from(stored.state)?;
    if state == CacheState::Exists && stored.payload.is_none() {
        return Ok(None);
    }
    let expires_at = stored
        .expires_at_ms
        .map(|ms| UNIX_EPOCH + Duration::from_millis(ms));
    Ok(Some(CacheValue::from_parts(
        state,
        stored.payload.map(Arc::new),
        expires_at,
    )))
}

/// Shared repository backed by Redis.
///
/// Per-key locks are process-local: they serialize population within this
/// process only.
pub struct RedisRepository<K: CacheKey, V> {
    redis: redis::aio::ConnectionManager,
    key_prefix: String,
    codec: Arc<dyn KeyCodec<K>>,
    retention: Duration,
    locks: KeyLocks<K>,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<K: CacheKey, V: Cacheable> RedisRepository<K, V> {
    /// Create a repository over an established connection manager.
    pub fn new(
        redis: redis::aio::ConnectionManager,
        key_prefix: impl Into<String>,
        codec: Arc<dyn KeyCodec<K>>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.into(),
            codec,
            retention: config.l2_ttl,
            locks: KeyLocks::new(),
            _value: std::marker::PhantomData,
        }
    }

    /// Connect to Redis and create the repository.
    pub async fn connect(
        redis_client: redis::Client,
        key_prefix: impl Into<String>,
        codec: Arc<dyn KeyCodec<K>>,
        config: &CacheConfig,
    ) -> Result<Self, CacheError> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self::new(redis, key_prefix, codec, config))
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn format_key(&self, key: &K) -> Result<String, CacheError> {
        Ok(format!("{}{}", self.key_prefix, self.codec.serialize(key)?))
    }

    /// All Redis keys under this repository's prefix.
    async fn scan_keys(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[async_trait::async_trait]
impl<K, V> Repository<K, V> for RedisRepository<K, V>
where
    K: CacheKey,
    V: Cacheable,
{
    async fn get_value(&self, key: &K) -> Result<CacheValue<V>, CacheError> {
        let redis_key = self.format_key(key)?;
        let mut conn = self.redis.clone();

        let Some(json) = conn.get::<_, Option<String>>(&redis_key).await? else {
            debug!("Cache miss L2 for key: {}", key);
            return Ok(CacheValue::missing());
        };

        match decode::<V>(&json)? {
            Some(value) => Ok(value.resolve(SystemTime::now())),
            None => {
                warn!(
                    "Failed to deserialize cached value for key {}. Deleting corrupt entry.",
                    key
                );
                if let Err(del_err) = conn.del::<_, ()>(&redis_key).await {
                    warn!(
                        "Failed to delete corrupt L2 entry for key {} (Redis key: {}): {}",
                        key, redis_key, del_err
                    );
                }
                Ok(CacheValue::missing())
            }
        }
    }

    async fn contains_key(&self, key: &K) -> Result<bool, CacheError> {
        let mut conn = self.redis.clone();
        Ok(conn.exists(self.format_key(key)?).await?)
    }

    async fn add_or_update(
        &self,
        key: &K,
        factory: &dyn ValueFactory<K, V>,
    ) -> Result<CacheValue<V>, CacheError> {
        let value = factory.create(key).await?;
        let json = encode(&value)?;
        let redis_key = self.format_key(key)?;
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(&redis_key, json, self.retention.as_secs().max(1))
            .await?;
        debug!("L2 stored {} for key: {}", value.state(), key);
        Ok(value)
    }

    async fn try_remove(&self, key: &K) -> Result<bool, CacheError> {
        let mut conn = self.redis.clone();
        let removed: u64 = conn.del(self.format_key(key)?).await?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let keys = self.scan_keys().await?;
        let mut conn = self.redis.clone();
        for batch in keys.chunks(SCAN_BATCH) {
            conn.del::<_, ()>(batch).await?;
        }
        debug!("L2 cleared {} keys under prefix {}", keys.len(), self.key_prefix);
        Ok(())
    }

    async fn enumerate(&self) -> Result<Vec<(K, CacheValue<V>)>, CacheError> {
        let keys = self.scan_keys().await?;
        let now = SystemTime::now();
        let mut conn = self.redis.clone();
        let mut entries = Vec::with_capacity(keys.len());

        for batch in keys.chunks(SCAN_BATCH) {
            let documents: Vec<Option<String>> = redis::cmd("MGET")
                .arg(batch)
                .query_async(&mut conn)
                .await?;
            for (redis_key, json) in batch.iter().zip(documents) {
                // Removed between SCAN and MGET
                let Some(json) = json else { continue };
                let Some(raw) = redis_key.strip_prefix(&self.key_prefix) else {
                    continue;
                };
                let key = self.codec.deserialize(raw)?;
                match decode::<V>(&json)? {
                    Some(value) => entries.push((key, value.resolve(now))),
                    None => warn!("Skipping corrupt L2 entry {}", redis_key),
                }
            }
        }
        Ok(entries)
    }

    async fn sync_lock(&self, key: &K) -> Result<KeyLock, CacheError> {
        Ok(self.locks.acquire(key).await)
    }
}
