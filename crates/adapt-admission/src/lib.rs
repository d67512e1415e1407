//! # adapt-admission
//!
//! The request-admission layer every Adapt API call passes through before it
//! reaches a resource handler.
//!
//! ## Overview
//!
//! - **Credential verification**: HMAC-signed bearer credentials carry the
//!   caller's identity claims
//! - **Authorization**: a declared role → capability table
//! - **Throttling**: fixed-window counting in a shared store, keyed by
//!   subject (or origin address for anonymous callers)
//! - **Read-through cache**: owner-scoped cache keys, invalidated after
//!   every write and before the write is acknowledged
//!
//! All shared mutable state lives in the [`store::KvStore`] handed to the
//! pipeline; nothing is kept in process-wide globals.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use adapt_admission::{AdmissionPipeline, CacheKey, RequestMeta, Role};
//! use adapt_admission::capability::TASKS_READ;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = AdmissionPipeline::builder()
//!         .with_secret("my-shared-secret")
//!         .build()?;
//!
//!     let token = pipeline.issuer().issue("u1", Role::User, true)?;
//!     let admitted = pipeline
//!         .admit(&RequestMeta::bearer(token), TASKS_READ)
//!         .await?;
//!
//!     let tasks = pipeline
//!         .read(&admitted, &CacheKey::collection("tasks", "u1"), None, || async {
//!             Ok(vec!["write the report".to_string()])
//!         })
//!         .await?;
//!     println!("{:?} ({})", tasks.value, tasks.status.as_str());
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod capability;
pub mod clock;
pub mod credential;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod throttle;

// Primary exports
pub use cache::{CacheKey, CacheStatus, Cached, ReadThroughCache};
pub use capability::{CapabilityTable, PolicyDecision};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{Claims, CredentialIssuer, CredentialVerifier, Identity, Role};
pub use error::{AdmissionError, CredentialError, ErrorBody, ResourceError, StoreError};
pub use pipeline::{
    Access, AdmissionPipeline, AdmissionPipelineBuilder, Admitted, Operation, PublicAdmission,
    Rejection, RequestMeta, Stage,
};
pub use throttle::{Admission, AdmissionThrottle, FailureMode, ThrottleKey, ThrottlePolicy};
