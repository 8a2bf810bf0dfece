//! Cached value wrapper and its state machine
//!
//! Every repository hands out a [`CacheValue`], which pairs an optional payload
//! with a [`CacheState`]:
//! - `Exists`: a fresh payload is present
//! - `NotFound`: the data source confirmed absence (negative entry)
//! - `Expired`: an entry was recorded but its time-to-live elapsed
//! - `Missing`: nothing was ever recorded for the key in this layer
//!
//! `Exists` and `NotFound` end a read; `Expired` and `Missing` send the read on
//! to the next layer.

use std::{
    fmt::{self, Display},
    hash::Hash,
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Trait for cache key types
pub trait CacheKey: Display + Hash + Eq + Clone + Send + Sync + 'static {}
impl<T> CacheKey for T where T: Display + Hash + Eq + Clone + Send + Sync + 'static {}

/// Trait for values that can be stored in a serializing layer such as Redis
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// State tag of a [`CacheValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacheState {
    Exists = 0,
    NotFound = 1,
    Expired = 2,
    Missing = 3,
}

impl CacheState {
    /// Whether a read can stop at this state without consulting another layer.
    pub fn is_terminal(self) -> bool {
        matches!(self, CacheState::Exists | CacheState::NotFound)
    }
}

impl From<CacheState> for u8 {
    fn from(state: CacheState) -> Self {
        state as u8
    }
}

impl TryFrom<u8> for CacheState {
    type Error = CacheError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(CacheState::Exists),
            1 => Ok(CacheState::NotFound),
            2 => Ok(CacheState::Expired),
            3 => Ok(CacheState::Missing),
            other => Err(CacheError::InvalidState(other)),
        }
    }
}

impl Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheState::Exists => "exists",
            CacheState::NotFound => "not-found",
            CacheState::Expired => "expired",
            CacheState::Missing => "missing",
        };
        f.write_str(name)
    }
}

/// A cached payload together with its state and optional absolute expiry.
///
/// The payload is only reachable through [`CacheValue::value`] while the
/// state is `Exists`.
#[derive(Debug)]
pub struct CacheValue<V> {
    state: CacheState,
    payload: Option<Arc<V>>,
    expires_at: Option<SystemTime>,
}

impl<V> Clone for CacheValue<V> {
    fn clone(&self) -> Self {
        Self {
            state: self.state,
            payload: self.payload.clone(),
            expires_at: self.expires_at,
        }
    }
}

impl<V: PartialEq> PartialEq for CacheValue<V> {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
            && self.payload == other.payload
            && self.expires_at == other.expires_at
    }
}

fn deadline(ttl: Option<Duration>) -> Option<SystemTime> {
    ttl.and_then(|ttl| SystemTime::now().checked_add(ttl))
}

impl<V> CacheValue<V> {
    /// A fresh value, expiring after `ttl` if one is given.
    pub fn exists(value: V, ttl: Option<Duration>) -> Self {
        Self::exists_arc(Arc::new(value), ttl)
    }

    pub fn exists_arc(value: Arc<V>, ttl: Option<Duration>) -> Self {
        Self {
            state: CacheState::Exists,
            payload: Some(value),
            expires_at: deadline(ttl),
        }
    }

    /// A negative entry recording that the data source has no value.
    pub fn not_found(ttl: Option<Duration>) -> Self {
        Self {
            state: CacheState::NotFound,
            payload: None,
            expires_at: deadline(ttl),
        }
    }

    pub fn expired() -> Self {
        Self {
            state: CacheState::Expired,
            payload: None,
            expires_at: None,
        }
    }

    pub fn missing() -> Self {
        Self {
            state: CacheState::Missing,
            payload: None,
            expires_at: None,
        }
    }

    /// Rebuild a value from stored parts. Payloads on non-`Exists` states are
    /// discarded.
    pub(crate) fn from_parts(
        state: CacheState,
        payload: Option<Arc<V>>,
        expires_at: Option<SystemTime>,
    ) -> Self {
        let payload = match state {
            CacheState::Exists => payload,
            _ => None,
        };
        Self {
            state,
            payload,
            expires_at,
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// The payload, present only for `Exists`.
    pub fn value(&self) -> Option<&Arc<V>> {
        match self.state {
            CacheState::Exists => self.payload.as_ref(),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Arc<V>> {
        match self.state {
            CacheState::Exists => self.payload,
            _ => None,
        }
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Whether a terminal entry has outlived its expiry at `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.state.is_terminal() && self.expires_at.is_some_and(|at| at <= now)
    }

    /// Report an elapsed `Exists`/`NotFound` entry as `Expired`.
    pub fn resolve(self, now: SystemTime) -> Self {
        if self.is_expired_at(now) {
            Self::expired()
        } else {
            self
        }
    }
}
