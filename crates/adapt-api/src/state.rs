//! Shared application state handed to every handler.

use crate::config::{Settings, StoreBackend};
use crate::repository::{MemoryRepository, ResourceRepository};
use adapt_admission::store::{KvStore, MemoryStore};
use adapt_admission::{AdmissionPipeline, SystemClock};
use anyhow::Context;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AdmissionPipeline>,
    pub repository: Arc<dyn ResourceRepository>,
    pub metrics: Option<PrometheusHandle>,
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(pipeline: AdmissionPipeline, repository: Arc<dyn ResourceRepository>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            repository,
            metrics: None,
            trust_forwarded_for: false,
        }
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    /// Assemble the pipeline and repository described by `settings`.
    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let store = connect_store(settings).await?;

        let pipeline = AdmissionPipeline::builder()
            .with_secret(&settings.auth.secret)
            .with_store(store)
            .with_store_timeout(Duration::from_millis(settings.store.timeout_ms))
            .with_throttle_policy(settings.throttle.policy())
            .with_cache_ttl(Duration::from_millis(settings.cache.ttl_ms))
            .with_token_ttl(Duration::from_secs(settings.auth.token_ttl_secs))
            .build()
            .context("invalid admission settings")?;

        let mut state = Self::new(pipeline, Arc::new(MemoryRepository::new()));
        state.trust_forwarded_for = settings.server.trust_forwarded_for;
        Ok(state)
    }

    /// State with in-process store and repository, for tests and local runs.
    pub fn in_memory(secret: &str) -> anyhow::Result<Self> {
        let pipeline = AdmissionPipeline::builder()
            .with_secret(secret)
            .build()
            .context("invalid admission settings")?;
        Ok(Self::new(pipeline, Arc::new(MemoryRepository::new())))
    }
}

async fn connect_store(settings: &Settings) -> anyhow::Result<Arc<dyn KvStore>> {
    match settings.store.backend {
        StoreBackend::Memory => {
            tracing::info!("using in-process store; limits are not shared across instances");
            Ok(Arc::new(MemoryStore::new(Arc::new(SystemClock))))
        }
        StoreBackend::Redis => connect_redis(settings).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(settings: &Settings) -> anyhow::Result<Arc<dyn KvStore>> {
    let url = settings
        .store
        .redis_url
        .as_deref()
        .context("store.redis_url is required for the redis backend")?;
    let store = adapt_admission::store::RedisStore::connect(url)
        .await
        .context("failed to connect to redis")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_settings: &Settings) -> anyhow::Result<Arc<dyn KvStore>> {
    anyhow::bail!("store.backend = \"redis\" requires building with the `redis` feature")
}
