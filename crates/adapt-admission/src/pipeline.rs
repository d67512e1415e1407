//! AdmissionPipeline - the ordered chain every API call passes through.
//!
//! ```text
//! RECEIVED ─verify─▶ VERIFIED ─authorize─▶ AUTHORIZED ─admit─▶ ADMITTED
//!     ─handle─▶ HANDLED ─(invalidate on write)─▶ RESPONDED
//! ```
//!
//! Any step may fail; the request then ends as a [`Rejection`] carrying the
//! state it failed from and the typed reason, and no later step runs. A
//! request that is not [`Admitted`] cannot reach the cache or a handler:
//! [`AdmissionPipeline::read`], [`AdmissionPipeline::handle`] and
//! [`AdmissionPipeline::write`] all require the proof value.

use crate::cache::{CacheKey, Cached, ReadThroughCache, DEFAULT_TTL};
use crate::capability::CapabilityTable;
use crate::clock::{Clock, SystemClock};
use crate::credential::{CredentialIssuer, CredentialVerifier, Identity};
use crate::error::{AdmissionError, CredentialError, ErrorBody, ResourceError};
use crate::store::{KvStore, MemoryStore, TimeoutStore, DEFAULT_STORE_TIMEOUT};
use crate::throttle::{Admission, AdmissionThrottle, ThrottleKey, ThrottlePolicy};
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Request lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Received,
    Verified,
    Authorized,
    Admitted,
    Handled,
    Responded,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Verified => "verified",
            Stage::Authorized => "authorized",
            Stage::Admitted => "admitted",
            Stage::Handled => "handled",
            Stage::Responded => "responded",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure: the state the request failed from, and why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("request failed after {stage}: {error}")]
pub struct Rejection {
    pub stage: Stage,
    pub error: AdmissionError,
}

impl Rejection {
    pub fn new(stage: Stage, error: impl Into<AdmissionError>) -> Self {
        let error = error.into();
        if error.is_upstream() {
            tracing::warn!(stage = %stage, code = error.code(), error = %error, "request rejected");
        } else {
            tracing::info!(stage = %stage, code = error.code(), "request rejected");
        }
        Self { stage, error }
    }

    pub fn status(&self) -> StatusCode {
        self.error.status()
    }

    pub fn code(&self) -> &'static str {
        self.error.code()
    }

    pub fn message(&self) -> String {
        self.error.message()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.error.retry_after()
    }

    /// Uniform `{ "error": { "code", "message" } }` body.
    pub fn body(&self) -> ErrorBody {
        ErrorBody::from(&self.error)
    }
}

/// What the pipeline needs to know about an incoming request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Bearer credential, if one was supplied.
    pub credential: Option<String>,
    /// Network origin of the caller.
    pub origin: Option<IpAddr>,
}

impl RequestMeta {
    pub fn new(credential: Option<String>, origin: Option<IpAddr>) -> Self {
        Self { credential, origin }
    }

    pub fn bearer(credential: impl Into<String>) -> Self {
        Self {
            credential: Some(credential.into()),
            origin: None,
        }
    }
}

/// Proof that a request was verified, authorized and admitted.
///
/// Only the pipeline constructs these.
#[derive(Debug, Clone)]
pub struct Admitted {
    identity: Identity,
    capability: String,
    admission: Admission,
}

impl Admitted {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn subject_id(&self) -> &str {
        &self.identity.subject_id
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }
}

/// Admission of a request on a public route.
#[derive(Debug, Clone)]
pub struct PublicAdmission {
    pub key: ThrottleKey,
    pub admission: Admission,
}

/// How an operation touches the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    /// Read served through the cache under `key`.
    Read {
        key: CacheKey,
        ttl: Option<Duration>,
    },
    /// Mutation; `invalidates` are deleted after the handler succeeds.
    Write { invalidates: Vec<CacheKey> },
}

/// A capability plus its cache access, as used by [`AdmissionPipeline::serve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub capability: String,
    pub access: Access,
}

impl Operation {
    pub fn read(capability: impl Into<String>, key: CacheKey) -> Self {
        Self {
            capability: capability.into(),
            access: Access::Read { key, ttl: None },
        }
    }

    pub fn write(capability: impl Into<String>, invalidates: Vec<CacheKey>) -> Self {
        Self {
            capability: capability.into(),
            access: Access::Write { invalidates },
        }
    }
}

/// The composed admission layer.
pub struct AdmissionPipeline {
    store: Arc<dyn KvStore>,
    verifier: CredentialVerifier,
    issuer: CredentialIssuer,
    capabilities: CapabilityTable,
    throttle: AdmissionThrottle,
    cache: ReadThroughCache,
}

impl AdmissionPipeline {
    pub fn builder() -> AdmissionPipelineBuilder {
        AdmissionPipelineBuilder::new()
    }

    /// The bounded shared store all stages use.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn verifier(&self) -> &CredentialVerifier {
        &self.verifier
    }

    /// Issuer sharing this pipeline's key.
    pub fn issuer(&self) -> &CredentialIssuer {
        &self.issuer
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn throttle(&self) -> &AdmissionThrottle {
        &self.throttle
    }

    pub fn cache(&self) -> &ReadThroughCache {
        &self.cache
    }

    /// Run verification, authorization and throttling for `capability`.
    pub async fn admit(
        &self,
        request: &RequestMeta,
        capability: &str,
    ) -> Result<Admitted, Rejection> {
        let credential = request
            .credential
            .as_deref()
            .ok_or_else(|| Rejection::new(Stage::Received, CredentialError::Missing))?;

        let identity = self
            .verifier
            .verify(credential)
            .map_err(|e| Rejection::new(Stage::Received, e))?;
        tracing::debug!(subject = %identity.subject_id, stage = %Stage::Verified, "stage transition");

        self.capabilities
            .authorize(&identity, capability)
            .map_err(|e| Rejection::new(Stage::Verified, e))?;
        tracing::debug!(subject = %identity.subject_id, stage = %Stage::Authorized, capability, "stage transition");

        let key = ThrottleKey::for_request(Some(&identity), request.origin);
        let admission = self
            .throttle
            .admit(&key)
            .await
            .map_err(|e| Rejection::new(Stage::Authorized, e))?;
        tracing::debug!(subject = %identity.subject_id, stage = %Stage::Admitted, remaining = admission.remaining, "stage transition");

        Ok(Admitted {
            identity,
            capability: capability.to_string(),
            admission,
        })
    }

    /// Throttle a request on a route that needs no capability.
    ///
    /// A valid credential attributes the request to its subject; otherwise
    /// it is counted against the origin address.
    pub async fn admit_public(&self, request: &RequestMeta) -> Result<PublicAdmission, Rejection> {
        let identity = request
            .credential
            .as_deref()
            .and_then(|c| self.verifier.verify(c).ok());

        let key = ThrottleKey::for_request(identity.as_ref(), request.origin);
        let admission = self
            .throttle
            .admit(&key)
            .await
            .map_err(|e| Rejection::new(Stage::Received, e))?;

        Ok(PublicAdmission { key, admission })
    }

    /// Serve a read through the cache.
    ///
    /// `ttl` defaults to the cache's configured lifetime.
    pub async fn read<T, F, Fut>(
        &self,
        _admitted: &Admitted,
        key: &CacheKey,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<Cached<T>, Rejection>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResourceError>>,
    {
        let ttl = ttl.unwrap_or_else(|| self.cache.default_ttl());
        self.cache
            .lookup(key, ttl, loader)
            .await
            .map_err(|e| Rejection::new(Stage::Admitted, e))
    }

    /// Run an uncached handler.
    pub async fn handle<T, F, Fut>(&self, _admitted: &Admitted, handler: F) -> Result<T, Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResourceError>>,
    {
        handler()
            .await
            .map_err(|e| Rejection::new(Stage::Admitted, e))
    }

    /// Run a mutating handler, then invalidate `invalidates`.
    ///
    /// The result is only returned once the invalidation has completed. If
    /// invalidation fails the write is reported as `SERVICE_UNAVAILABLE`,
    /// never as a success that could be followed by a stale read.
    pub async fn write<T, F, Fut>(
        &self,
        admitted: &Admitted,
        invalidates: &[CacheKey],
        handler: F,
    ) -> Result<T, Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResourceError>>,
    {
        let value = self.handle(admitted, handler).await?;
        tracing::debug!(subject = %admitted.subject_id(), stage = %Stage::Handled, "stage transition");

        if let Err(err) = self.cache.invalidate(invalidates).await {
            tracing::error!(
                subject = %admitted.subject_id(),
                keys = ?invalidates,
                error = %err,
                "write committed but cache invalidation failed"
            );
            return Err(Rejection::new(Stage::Handled, err));
        }

        Ok(value)
    }

    /// Run the full chain for one operation.
    pub async fn serve<T, F, Fut>(
        &self,
        request: &RequestMeta,
        operation: &Operation,
        handler: F,
    ) -> Result<Cached<T>, Rejection>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Identity) -> Fut,
        Fut: Future<Output = Result<T, ResourceError>>,
    {
        let admitted = self.admit(request, &operation.capability).await?;
        let identity = admitted.identity().clone();

        let served = match &operation.access {
            Access::Read { key, ttl } => {
                self.read(&admitted, key, *ttl, || handler(identity))
                    .await?
            }
            Access::Write { invalidates } => {
                let value = self
                    .write(&admitted, invalidates, || handler(identity))
                    .await?;
                Cached {
                    value,
                    status: crate::cache::CacheStatus::Bypass,
                }
            }
        };
        tracing::debug!(subject = %admitted.subject_id(), stage = %Stage::Responded, "stage transition");

        Ok(served)
    }
}

impl fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("throttle", &self.throttle)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Builder for [`AdmissionPipeline`].
pub struct AdmissionPipelineBuilder {
    secret: String,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn KvStore>>,
    store_timeout: Duration,
    capabilities: Option<CapabilityTable>,
    throttle: ThrottlePolicy,
    cache_ttl: Duration,
    token_ttl: Option<Duration>,
}

impl AdmissionPipelineBuilder {
    fn new() -> Self {
        Self {
            secret: String::new(),
            clock: None,
            store: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            capabilities: None,
            throttle: ThrottlePolicy::default(),
            cache_ttl: DEFAULT_TTL,
            token_ttl: None,
        }
    }

    /// Set the credential signing secret (required).
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the shared store. Defaults to an in-process [`MemoryStore`].
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Bound on each store call.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_capabilities(mut self, table: CapabilityTable) -> Self {
        self.capabilities = Some(table);
        self
    }

    pub fn with_throttle_policy(mut self, policy: ThrottlePolicy) -> Self {
        self.throttle = policy;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Lifetime of credentials minted by [`AdmissionPipeline::issuer`].
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = Some(ttl);
        self
    }

    pub fn build(self) -> Result<AdmissionPipeline, AdmissionError> {
        if self.secret.is_empty() {
            return Err(AdmissionError::Configuration(
                "secret is required for AdmissionPipeline".to_string(),
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(AdmissionError::Configuration(
                "store timeout must be greater than zero".to_string(),
            ));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let inner = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(clock.clone())));
        let store: Arc<dyn KvStore> = Arc::new(TimeoutStore::new(inner, self.store_timeout));

        let mut issuer = CredentialIssuer::new(&self.secret, clock.clone())?;
        if let Some(ttl) = self.token_ttl {
            issuer = issuer.with_ttl(ttl);
        }

        Ok(AdmissionPipeline {
            store: store.clone(),
            verifier: CredentialVerifier::new(&self.secret, clock.clone())?,
            issuer,
            capabilities: self.capabilities.unwrap_or_else(CapabilityTable::standard),
            throttle: AdmissionThrottle::new(store.clone(), self.throttle)?,
            cache: ReadThroughCache::new(store, clock).with_default_ttl(self.cache_ttl),
        })
    }
}
