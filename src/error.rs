use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

// Failures of the shared counter store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("window of {0}s is out of range for the counter store")]
    WindowOutOfRange(u64),
}

// Failures of one proxy round-trip
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("backend timed out")]
    Timeout,

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("request body exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("request body not received within {0:?}")]
    RequestBodyTimeout(Duration),

    #[error("backend response body exceeds {0} bytes")]
    ResponseTooLarge(usize),

    #[error("invalid outbound uri: {0}")]
    InvalidUri(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid backend url: {0}")]
    InvalidBackend(String),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("http client build failed: {0}")]
    HttpClient(#[from] reqwest::Error),
}

// Per-request errors, each mapped to the status the caller sees
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limit of {limit} requests exceeded, retry after {retry_after_secs}s")]
    RateLimited { limit: u64, retry_after_secs: u64 },

    #[error("rate limit store unavailable")]
    StoreUnavailable { retry_after_secs: u64 },

    #[error("too many requests in flight")]
    Overloaded,

    #[error("backend service unavailable")]
    BackendUnavailable,

    #[error("gateway timeout")]
    BackendTimeout,

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request body not received in time")]
    RequestTimeout,

    #[error("backend response too large")]
    UpstreamTooLarge,

    #[error("internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            GatewayError::UpstreamTooLarge => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::StoreUnavailable { .. } => "RATE_LIMIT_STORE_UNAVAILABLE",
            GatewayError::Overloaded => "CONCURRENCY_LIMIT_EXCEEDED",
            GatewayError::BackendUnavailable => "BACKEND_UNAVAILABLE",
            GatewayError::BackendTimeout => "BACKEND_TIMEOUT",
            GatewayError::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayError::UpstreamTooLarge => "UPSTREAM_TOO_LARGE",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs, .. }
            | GatewayError::StoreUnavailable { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl From<ForwardError> for GatewayError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Timeout => GatewayError::BackendTimeout,
            ForwardError::Unavailable(_) => GatewayError::BackendUnavailable,
            ForwardError::RequestTooLarge(_) => GatewayError::PayloadTooLarge,
            ForwardError::RequestBody(msg) => GatewayError::BadRequest(msg),
            ForwardError::RequestBodyTimeout(_) => GatewayError::RequestTimeout,
            ForwardError::ResponseTooLarge(_) => GatewayError::UpstreamTooLarge,
            ForwardError::InvalidUri(msg) => GatewayError::Internal(msg),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = GatewayError::RateLimited {
            limit: 5,
            retry_after_secs: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn overloaded_has_no_retry_after() {
        let response = GatewayError::Overloaded.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn forward_errors_map_to_statuses() {
        assert_eq!(
            GatewayError::from(ForwardError::Timeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::from(ForwardError::Unavailable("refused".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::from(ForwardError::RequestTooLarge(10)).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::from(ForwardError::ResponseTooLarge(10)).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::from(ForwardError::RequestBodyTimeout(Duration::from_secs(1))).status(),
            StatusCode::REQUEST_TIMEOUT
        );
    }
}
