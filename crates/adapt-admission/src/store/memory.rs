use super::{KvStore, WindowCount};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process store with clock-driven expiry.
///
/// Every operation takes the map lock once, so increments are atomic with
/// respect to each other. Latency and outages can be injected to exercise
/// the timeout and failure policies.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    latency: Mutex<Option<Duration>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            latency: Mutex::new(None),
            available: AtomicBool::new(true),
        }
    }

    /// Delay every call by `latency` before it runs.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Make every call fail with [`StoreError::Unavailable`] until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn simulate(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.lock().len())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.simulate().await?;
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.simulate().await?;
        let expires_at = self.clock.now() + to_chrono(ttl)?;

        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        self.simulate().await?;
        let now = self.clock.now();
        let window_end = now + to_chrono(window)?;
        let mut entries = self.entries.lock();

        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if !e.is_live(now) {
                    e.value = "0".to_string();
                    e.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: None,
            });

        let count = entry
            .value
            .parse::<u64>()
            .map_err(|_| StoreError::Protocol(format!("value at '{}' is not a counter", key)))?
            + 1;
        entry.value = count.to_string();

        let expires_at = *entry.expires_at.get_or_insert(window_end);
        let ttl = (expires_at - now).to_std().unwrap_or(Duration::ZERO);

        Ok(WindowCount { count, ttl })
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.simulate().await?;
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, StoreError> {
    chrono::Duration::from_std(duration)
        .map_err(|_| StoreError::Protocol(format!("ttl out of range: {:?}", duration)))
}
