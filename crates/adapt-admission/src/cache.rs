//! Read-through cache with write invalidation.
//!
//! Reads look the key up in the shared store and fall back to the loader on
//! a miss, an expired entry, an undecodable entry or a store failure. Writes
//! delete every affected key before the write is acknowledged.
//!
//! Concurrent misses on the same key may each run the loader; loads are
//! idempotent reads, so the redundant stores carry equivalent values.
//!
//! A load can overlap a write: it reads the old value, the write commits and
//! invalidates, then the load stores what it read. To keep that value from
//! being served, each invalidation leaves a marker (`<key>#inv`) holding the
//! time it ran, and every entry carries the time its load started. An entry
//! whose load started at or before the marker is treated as a miss. Markers
//! live for the cache's default ttl, which also caps every entry's lifetime.

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::KvStore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default lifetime of a cache entry (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Suffix of the key recording when an entry was last invalidated.
const INVALIDATED_SUFFIX: &str = "#inv";

/// Cache key namespaced by resource type and owning identity.
///
/// Segments are escaped so that no owner id can produce another owner's
/// key, an item key, a global key or an invalidation marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Per-identity collection, e.g. `tasks:u1`.
    pub fn collection(resource: &str, owner: &str) -> Self {
        Self(format!("{}:{}", escape(resource), escape(owner)))
    }

    /// Single item owned by an identity, e.g. `tasks:u1:42`.
    pub fn item(resource: &str, owner: &str, id: impl fmt::Display) -> Self {
        Self(format!(
            "{}:{}:{}",
            escape(resource),
            escape(owner),
            escape(&id.to_string())
        ))
    }

    /// Listing that spans every identity, e.g. `users::all`.
    pub fn global(resource: &str) -> Self {
        Self(format!("{}::all", escape(resource)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for c in segment.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            '#' => escaped.push_str("%23"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn marker_key(key: &CacheKey) -> String {
    format!("{}{}", key.as_str(), INVALIDATED_SUFFIX)
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the store without running the loader.
    Hit,
    /// Loaded and written back to the store.
    Miss,
    /// Loaded while the store was failing; nothing was written back.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// A value together with how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub status: CacheStatus,
}

/// What is stored under a cache key.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: serde_json::Value,
    /// When the load that produced `value` started.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    loaded_at: DateTime<Utc>,
    ttl_ms: u64,
}

impl Envelope {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age_ms = now
            .timestamp_millis()
            .saturating_sub(self.loaded_at.timestamp_millis());
        // Negative age means the writer's clock runs ahead of ours.
        age_ms < 0 || (age_ms as u64) < self.ttl_ms
    }
}

/// Read-through cache over the shared store.
#[derive(Clone)]
pub struct ReadThroughCache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl ReadThroughCache {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_ttl: DEFAULT_TTL,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Return the cached value for `key`, or run `loader` and cache its result.
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.lookup(key, ttl, loader).await.map(|cached| cached.value)
    }

    /// Like [`get_or_load`](Self::get_or_load), also reporting hit or miss.
    ///
    /// `ttl` is capped at the cache's default ttl.
    pub async fn lookup<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        loader: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ttl = ttl.min(self.default_ttl);
        let store_healthy = match self.store.get(key.as_str()).await {
            Ok(Some(raw)) => match self.decode_fresh::<T>(key, &raw) {
                Some((value, loaded_at)) => match self.invalidated_at(key).await {
                    Ok(Some(marker)) if marker >= loaded_at.timestamp_millis() => {
                        tracing::debug!(key = %key, "cache entry predates invalidation");
                        true
                    }
                    Ok(_) => {
                        tracing::debug!(key = %key, "cache hit");
                        return Ok(Cached {
                            value,
                            status: CacheStatus::Hit,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "cache marker read failed, treating as miss");
                        false
                    }
                },
                None => true,
            },
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "cache read failed, treating as miss");
                false
            }
        };

        let loaded_at = self.clock.now();
        let value = loader().await?;

        if !store_healthy || ttl.is_zero() {
            return Ok(Cached {
                value,
                status: CacheStatus::Bypass,
            });
        }

        let status = match self.store_value(key, &value, loaded_at, ttl).await {
            Ok(()) => CacheStatus::Miss,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "cache write failed");
                CacheStatus::Bypass
            }
        };
        tracing::debug!(key = %key, status = status.as_str(), "cache populated");

        Ok(Cached { value, status })
    }

    /// Mark every entry in `keys` invalidated as of now, then delete them.
    ///
    /// Callers run this after a write commits and before acknowledging it.
    pub async fn invalidate(&self, keys: &[CacheKey]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        if !self.default_ttl.is_zero() {
            let stamp = self.clock.now().timestamp_millis().to_string();
            for key in keys {
                self.store
                    .set_with_ttl(&marker_key(key), &stamp, self.default_ttl)
                    .await?;
            }
        }
        let raw: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        self.store.delete(&raw).await?;
        tracing::debug!(keys = ?raw, "cache invalidated");
        Ok(())
    }

    /// Time of the last invalidation of `key` in epoch milliseconds.
    async fn invalidated_at(&self, key: &CacheKey) -> Result<Option<i64>, StoreError> {
        let raw = self.store.get(&marker_key(key)).await?;
        // An unreadable marker invalidates everything under the key.
        Ok(raw.map(|raw| raw.parse().unwrap_or(i64::MAX)))
    }

    fn decode_fresh<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        raw: &str,
    ) -> Option<(T, DateTime<Utc>)> {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "undecodable cache entry");
                return None;
            }
        };
        if !envelope.is_fresh(self.clock.now()) {
            return None;
        }
        match serde_json::from_value(envelope.value) {
            Ok(value) => Some((value, envelope.loaded_at)),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "cache entry has unexpected shape");
                None
            }
        }
    }

    async fn store_value<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        loaded_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let envelope = Envelope {
            value: serde_json::to_value(value)
                .map_err(|e| StoreError::Protocol(format!("encoding cache value: {}", e)))?,
            loaded_at,
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        let raw = serde_json::to_string(&envelope)
            .map_err(|e| StoreError::Protocol(format!("encoding cache entry: {}", e)))?;

        self.store.set_with_ttl(key.as_str(), &raw, ttl).await
    }
}

impl fmt::Debug for ReadThroughCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadThroughCache")
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}
