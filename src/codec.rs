//! Key codecs
//!
//! Notification routers and serializing layers address entries by string.
//! A [`KeyCodec`] maps the native key type to that string form and back; it
//! must round-trip exactly for every key that is ever cached. A key with no
//! string form is an error, never a shared fallback string.

use std::{fmt::Display, marker::PhantomData, str::FromStr};

use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Trait for converting cache keys to and from their transport string
pub trait KeyCodec<K>: Send + Sync + 'static {
    /// Build the transport string for a key
    fn serialize(&self, key: &K) -> Result<String, CacheError>;

    /// Parse a transport string back into the key type
    fn deserialize(&self, raw: &str) -> Result<K, CacheError>;
}

/// Codec for keys whose `Display` output parses back through `FromStr`
pub struct DisplayCodec<K>(PhantomData<fn() -> K>);

impl<K> DisplayCodec<K> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<K> Default for DisplayCodec<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyCodec<K> for DisplayCodec<K>
where
    K: Display + FromStr + 'static,
    K::Err: Display,
{
    fn serialize(&self, key: &K) -> Result<String, CacheError> {
        Ok(key.to_string())
    }

    fn deserialize(&self, raw: &str) -> Result<K, CacheError> {
        raw.parse::<K>()
            .map_err(|e| CacheError::Codec(format!("cannot parse key '{}': {}", raw, e)))
    }
}

/// Codec that encodes keys as JSON, for structured key types
pub struct JsonCodec<K>(PhantomData<fn() -> K>);

impl<K> JsonCodec<K> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<K> Default for JsonCodec<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyCodec<K> for JsonCodec<K>
where
    K: Serialize + DeserializeOwned + 'static,
{
    fn serialize(&self, key: &K) -> Result<String, CacheError> {
        // Maps with non-string keys, for one, have no JSON form
        serde_json::to_string(key)
            .map_err(|e| CacheError::Codec(format!("cannot encode key: {}", e)))
    }

    fn deserialize(&self, raw: &str) -> Result<K, CacheError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Codec built from a pair of injected functions
pub struct FnCodec<S, D> {
    serialize: S,
    deserialize: D,
}

impl<S, D> FnCodec<S, D> {
    pub fn new(serialize: S, deserialize: D) -> Self {
        Self {
            serialize,
            deserialize,
        }
    }
}

impl<K, S, D> KeyCodec<K> for FnCodec<S, D>
where
    S: Fn(&K) -> Result<String, CacheError> + Send + Sync + 'static,
    D: Fn(&str) -> Result<K, CacheError> + Send + Sync + 'static,
{
    fn serialize(&self, key: &K) -> Result<String, CacheError> {
        (self.serialize)(key)
    }

    fn deserialize(&self, raw: &str) -> Result<K, CacheError> {
        (self.deserialize)(raw)
    }
}
