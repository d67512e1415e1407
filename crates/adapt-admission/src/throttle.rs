//! Fixed-window admission throttle.
//!
//! Each request atomically increments a counter in the shared store. The
//! first increment of a window attaches the window expiry, and a request
//! whose post-increment count exceeds the limit is rejected. The count and
//! the comparison come from a single store call, so two concurrent requests
//! can never both see a sub-limit count when only one of them fits.

use crate::credential::Identity;
use crate::error::AdmissionError;
use crate::store::KvStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LIMIT: u64 = 100;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_PREFIX: &str = "rl:";

/// What to do when the store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Admit the request and log the outage.
    FailOpen,
    /// Reject with `SERVICE_UNAVAILABLE`.
    #[default]
    FailClosed,
}

/// Limit, window and outage behaviour of the throttle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub limit: u64,
    pub window: Duration,
    pub failure_mode: FailureMode,
    /// Namespace for counter keys in the store.
    pub prefix: String,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window: DEFAULT_WINDOW,
            failure_mode: FailureMode::default(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl ThrottlePolicy {
    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.limit == 0 {
            return Err(AdmissionError::Configuration(
                "throttle limit must be greater than zero".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(AdmissionError::Configuration(
                "throttle window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThrottleKey {
    /// Authenticated subject.
    Subject(String),
    /// Network origin of an anonymous caller.
    Origin(IpAddr),
    /// Anonymous caller whose origin is not known.
    Unattributed,
}

impl ThrottleKey {
    /// Prefer the identity; fall back to the origin address.
    pub fn for_request(identity: Option<&Identity>, origin: Option<IpAddr>) -> Self {
        match (identity, origin) {
            (Some(identity), _) => Self::Subject(identity.subject_id.clone()),
            (None, Some(addr)) => Self::Origin(addr),
            (None, None) => Self::Unattributed,
        }
    }

    fn store_key(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self)
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subject(id) => write!(f, "user:{}", id),
            Self::Origin(addr) => write!(f, "ip:{}", addr),
            Self::Unattributed => f.write_str("ip:unknown"),
        }
    }
}

/// A request that fits within its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub limit: u64,
    /// Requests counted in the current window, this one included.
    pub count: u64,
    pub remaining: u64,
    /// Time until the window resets.
    pub reset_after: Duration,
    /// Admitted without consulting the store (fail-open outage).
    pub degraded: bool,
}

/// Per-key request throttle backed by the shared store.
#[derive(Clone)]
pub struct AdmissionThrottle {
    store: Arc<dyn KvStore>,
    policy: ThrottlePolicy,
}

impl AdmissionThrottle {
    pub fn new(store: Arc<dyn KvStore>, policy: ThrottlePolicy) -> Result<Self, AdmissionError> {
        policy.validate()?;
        Ok(Self { store, policy })
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Admit one request for `key` under the configured limit and window.
    pub async fn admit(&self, key: &ThrottleKey) -> Result<Admission, AdmissionError> {
        self.admit_with(key, self.policy.limit, self.policy.window)
            .await
    }

    /// Admit one request for `key` under an explicit limit and window.
    pub async fn admit_with(
        &self,
        key: &ThrottleKey,
        limit: u64,
        window: Duration,
    ) -> Result<Admission, AdmissionError> {
        let store_key = key.store_key(&self.policy.prefix);

        let counted = match self.store.incr_with_expiry(&store_key, window).await {
            Ok(counted) => counted,
            Err(err) => {
                return match self.policy.failure_mode {
                    FailureMode::FailOpen => {
                        tracing::warn!(key = %key, error = %err, "throttle store unavailable, admitting (fail-open)");
                        Ok(Admission {
                            limit,
                            count: 0,
                            remaining: limit,
                            reset_after: window,
                            degraded: true,
                        })
                    }
                    FailureMode::FailClosed => {
                        tracing::warn!(key = %key, error = %err, "throttle store unavailable, rejecting (fail-closed)");
                        Err(AdmissionError::UpstreamUnavailable(err))
                    }
                };
            }
        };

        if counted.count > limit {
            tracing::info!(
                key = %key,
                count = counted.count,
                limit,
                retry_after_ms = counted.ttl.as_millis() as u64,
                "rate limit exceeded"
            );
            return Err(AdmissionError::RateLimitExceeded {
                retry_after: counted.ttl,
            });
        }

        Ok(Admission {
            limit,
            count: counted.count,
            remaining: limit - counted.count,
            reset_after: counted.ttl,
            degraded: false,
        })
    }
}

impl fmt::Debug for AdmissionThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionThrottle")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
