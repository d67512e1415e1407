//! Admission middleware.
//!
//! Runs the pipeline's verify, authorize and throttle stages in front of a
//! group of routes:
//! - Reads the bearer credential from `Authorization: Bearer` or the legacy
//!   `x-auth-token` header
//! - Resolves the caller's origin address (socket peer, or the first
//!   `x-forwarded-for` hop when trusted)
//! - Picks the read or write capability from the HTTP method
//! - Adds [`Admitted`] to request extensions and `RateLimit-*` headers to
//!   the response
//!
//! Rejected requests never reach the handler.

use crate::error::{ceil_secs, ApiError};
use crate::state::AppState;
use crate::telemetry::record_outcome;
use adapt_admission::{Admission, RequestMeta};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};

const AUTH_TOKEN_HEADER: &str = "x-auth-token";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

const RATELIMIT_LIMIT: &str = "ratelimit-limit";
const RATELIMIT_REMAINING: &str = "ratelimit-remaining";
const RATELIMIT_RESET: &str = "ratelimit-reset";

/// Credential carried by the request, if any.
fn credential(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });

    bearer
        .or_else(|| {
            headers
                .get(AUTH_TOKEN_HEADER)
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
        })
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|hop| hop.trim().parse().ok())
}

/// Extract what the pipeline needs from an incoming request.
pub fn request_meta(request: &Request, trust_forwarded_for: bool) -> RequestMeta {
    let headers = request.headers();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let origin = if trust_forwarded_for {
        forwarded_for(headers).or(peer)
    } else {
        peer
    };

    RequestMeta::new(credential(headers), origin)
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, admission: &Admission) {
    if admission.degraded {
        return;
    }
    headers.insert(
        HeaderName::from_static(RATELIMIT_LIMIT),
        HeaderValue::from(admission.limit),
    );
    headers.insert(
        HeaderName::from_static(RATELIMIT_REMAINING),
        HeaderValue::from(admission.remaining),
    );
    headers.insert(
        HeaderName::from_static(RATELIMIT_RESET),
        HeaderValue::from(ceil_secs(admission.reset_after)),
    );
}

/// Outcome code recorded for a request the throttle let through.
fn admitted_code(admission: &Admission) -> &'static str {
    if admission.degraded {
        "ADMITTED_DEGRADED"
    } else {
        "ADMITTED"
    }
}

/// Capabilities guarding one group of routes.
#[derive(Clone)]
pub struct CapabilityGuard {
    pub state: AppState,
    pub read: &'static str,
    pub write: &'static str,
}

impl CapabilityGuard {
    pub fn new(state: AppState, read: &'static str, write: &'static str) -> Self {
        Self { state, read, write }
    }

    /// Guard whose routes all need the same capability.
    pub fn single(state: AppState, capability: &'static str) -> Self {
        Self::new(state, capability, capability)
    }

    fn capability_for(&self, method: &Method) -> &'static str {
        match *method {
            Method::GET | Method::HEAD | Method::OPTIONS => self.read,
            _ => self.write,
        }
    }
}

/// Admit the request or answer with the rejection.
pub async fn admission_middleware(
    State(guard): State<CapabilityGuard>,
    mut request: Request,
    next: Next,
) -> Response {
    let meta = request_meta(&request, guard.state.trust_forwarded_for);
    let capability = guard.capability_for(request.method());

    let admitted = match guard.state.pipeline.admit(&meta, capability).await {
        Ok(admitted) => admitted,
        Err(rejection) => {
            record_outcome(rejection.code());
            return ApiError(rejection).into_response();
        }
    };
    record_outcome(admitted_code(admitted.admission()));

    let admission = admitted.admission().clone();
    request.extensions_mut().insert(admitted);

    let mut response = next.run(request).await;
    insert_rate_limit_headers(response.headers_mut(), &admission);
    response
}

/// Throttle an unguarded route by subject or origin.
pub async fn public_admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let meta = request_meta(&request, state.trust_forwarded_for);

    let admission = match state.pipeline.admit_public(&meta).await {
        Ok(public) => public.admission,
        Err(rejection) => {
            record_outcome(rejection.code());
            return ApiError(rejection).into_response();
        }
    };
    record_outcome(admitted_code(&admission));

    let mut response = next.run(request).await;
    insert_rate_limit_headers(response.headers_mut(), &admission);
    response
}
