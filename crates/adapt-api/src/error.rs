//! HTTP rendering of pipeline rejections.

use adapt_admission::{ErrorBody, Rejection, ResourceError, Stage};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;

/// A [`Rejection`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Rejection);

impl ApiError {
    /// Request input rejected before it reached the repository.
    pub fn validation(message: impl Into<String>) -> Self {
        Self(Rejection::new(
            Stage::Admitted,
            ResourceError::Validation(message.into()),
        ))
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self(rejection)
    }
}

/// Whole seconds, rounded up, never below one.
pub fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let rejection = self.0;
        let mut response = (rejection.status(), Json(rejection.body())).into_response();

        if let Some(retry_after) = rejection.retry_after() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(ceil_secs(retry_after)),
            );
        }
        response
    }
}

/// Give the bare 408 and 413 answers of the timeout and body-limit layers
/// the same `{ "error": { "code", "message" } }` body as every other error.
pub async fn uniform_layer_errors(response: Response) -> Response {
    let (code, message) = match response.status() {
        StatusCode::REQUEST_TIMEOUT => ("REQUEST_TIMEOUT", "Request timed out"),
        StatusCode::PAYLOAD_TOO_LARGE => ("PAYLOAD_TOO_LARGE", "Request body is too large"),
        _ => return response,
    };
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .is_some_and(|v| v.as_bytes().starts_with(b"application/json"));
    if is_json {
        return response;
    }

    (response.status(), Json(ErrorBody::new(code, message))).into_response()
}
