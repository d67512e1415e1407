//! # adapt-api
//!
//! HTTP surface of the Adapt platform. Accounts register or log in to get a
//! credential; every other `/api` route is guarded by the admission
//! pipeline from `adapt-admission`: the credential is verified,
//! the route's capability checked against the caller's role, and the
//! request counted against the caller's throttle window before a handler
//! runs. Reads are served through the read-through cache; writes invalidate
//! the affected keys before they are acknowledged.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod router;
pub mod state;
pub mod telemetry;

pub use crate::config::Settings;
pub use crate::error::ApiError;
pub use crate::router::create_router;
pub use crate::state::AppState;
