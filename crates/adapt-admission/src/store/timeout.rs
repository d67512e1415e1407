use super::{KvStore, WindowCount};
use crate::error::StoreError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Bounds every call on the wrapped store.
///
/// A call that overruns resolves to [`StoreError::Timeout`]; what happens
/// next is up to the caller's failure policy.
#[derive(Clone)]
pub struct TimeoutStore {
    inner: Arc<dyn KvStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn KvStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

impl std::fmt::Debug for TimeoutStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KvStore for TimeoutStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.bounded(self.inner.get(key)).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.bounded(self.inner.set_with_ttl(key, value, ttl)).await
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        self.bounded(self.inner.incr_with_expiry(key, window)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.bounded(self.inner.delete(keys)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let memory = Arc::new(MemoryStore::new(Arc::new(ManualClock::at_epoch())));
        memory.set_latency(Some(Duration::from_secs(5)));
        let store = TimeoutStore::new(memory, Duration::from_millis(250));

        let err = store.get("k").await.unwrap_err();
        assert_eq!(err, StoreError::Timeout(Duration::from_millis(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_call_passes_through() {
        let memory = Arc::new(MemoryStore::new(Arc::new(ManualClock::at_epoch())));
        memory.set_latency(Some(Duration::from_millis(10)));
        let store = TimeoutStore::new(memory, DEFAULT_STORE_TIMEOUT);

        store
            .set_with_ttl("k", "v", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
