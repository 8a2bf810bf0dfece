//! tiercache - Two-layer caching library
//!
//! This library coordinates two cache layers in front of an authoritative
//! data source:
//! - Layer 1: fast, process-local repository (Moka or in-memory)
//! - Layer 2: shared repository (Redis or in-memory)
//! - Data source: pluggable backend (database, HTTP, etc.)
//!
//! The cache supports:
//! - Read-through population with one data source load per key under contention
//! - Negative caching of keys the data source does not have
//! - Invalidation routing (in-process or Redis pub/sub) that keeps layer 1
//!   in step with layer 2 across instances
//! - Generic key and value types with injected key codecs

mod codec;
mod config;
mod error;
pub mod notify;
pub mod repository;
mod source;
mod two_layer_cache;
mod value;

pub use codec::{DisplayCodec, FnCodec, JsonCodec, KeyCodec};
pub use config::CacheConfig;
pub use error::CacheError;
pub use notify::{
    Invalidation, InvalidationHandler, LocalNotifications, LocalRouter, NotificationsProvider,
    NotificationsRouter, RedisKeyspaceNotifications, RedisRouter,
};
pub use repository::{
    KeyLock, KeyLocks, MemoryRepository, MokaRepository, RedisRepository, Repository,
    ValueFactory,
};
pub use source::{BoxError, DataSource};
pub use two_layer_cache::{TwoLayerCache, TwoLayerCacheBuilder};
pub use value::{CacheKey, CacheState, CacheValue, Cacheable};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
