//! Shared key-value store used for rate windows and cache entries.
//!
//! Components only ever talk to the store through [`KvStore`], which offers
//! four self-contained operations. There is no read-modify-write sequence
//! anywhere in this crate: counting goes through
//! [`KvStore::incr_with_expiry`], which the backend performs atomically.
//!
//! ## Backends
//!
//! - [`MemoryStore`]: single-process store, also the fake used in tests
//! - [`TimeoutStore`]: bounds every call on another store
//! - `RedisStore`: network store shared by every instance (`redis` feature)

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod timeout;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use timeout::{TimeoutStore, DEFAULT_STORE_TIMEOUT};

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

/// Counter state returned by an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Value after the increment.
    pub count: u64,
    /// Time until the counter expires.
    pub ttl: Duration,
}

/// Atomic operations offered by the shared store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value. Expired keys read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically increment the counter at `key`.
    ///
    /// The first increment of a fresh counter sets its expiry to `window`.
    /// Later increments leave the expiry alone.
    async fn incr_with_expiry(&self, key: &str, window: Duration)
        -> Result<WindowCount, StoreError>;

    /// Remove keys. Missing keys are not an error.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
}
