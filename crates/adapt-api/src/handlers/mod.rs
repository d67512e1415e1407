//! HTTP request handlers

pub mod auth;
pub mod extract;
pub mod health;
pub mod resources;
pub mod users;

pub use extract::ValidatedJson;
pub use health::{health, live, metrics, ready, version};

use adapt_admission::CacheStatus;
use axum::http::{HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};

/// Attach `X-Cache: HIT | MISS | BYPASS` to a cached read.
pub(crate) fn with_cache_status(body: impl IntoResponse, status: CacheStatus) -> Response {
    let mut response = body.into_response();
    response.headers_mut().insert(
        HeaderName::from_static("x-cache"),
        HeaderValue::from_static(status.as_str()),
    );
    response
}
