use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error taxonomy surfaced by the gateway.
///
/// `Clone` is required so a single in-flight fetch outcome can be handed
/// to every caller waiting on the same cache key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("upstream resource not found")]
    NotFound,

    #[error("upstream returned status {status}")]
    Upstream { status: u16 },

    #[error("upstream transport failure: {0}")]
    Transport(String),

    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("all aggregate sub-fetches failed")]
    Aggregate,

    #[error("cache store failure: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Only a taxonomy-level kind and message go to the client; upstream
        // bodies and internal detail stay in the logs.
        let (status, body) = match &self {
            GatewayError::NotFound => (
                StatusCode::NOT_FOUND,
                ErrorBody::new("not_found", "Upstream resource not found"),
            ),
            GatewayError::Upstream { status } => {
                tracing::error!(status, "upstream returned a non-success status");
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorBody::new("upstream_error", "Upstream request failed"),
                )
            }
            GatewayError::Transport(reason) => {
                tracing::error!(%reason, "upstream transport failure");
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorBody::new("transport_error", "Upstream request failed"),
                )
            }
            GatewayError::RateLimited { retry_after } => {
                let body = ErrorBody::new("rate_limited", "Request rate limit exceeded");
                let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                // Round up so a client that waits the advertised time is
                // guaranteed to find a free slot.
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                if let Ok(value) = secs.to_string().parse() {
                    resp.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return resp;
            }
            GatewayError::InvalidSignature => (
                StatusCode::BAD_REQUEST,
                ErrorBody::new("invalid_signature", "Webhook signature verification failed"),
            ),
            GatewayError::Aggregate => (
                StatusCode::BAD_GATEWAY,
                ErrorBody::new("aggregate_error", "All upstream fetches failed"),
            ),
            GatewayError::Cache(reason) => {
                tracing::error!(%reason, "cache store failure");
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorBody::new("cache_error", "Cache store unavailable"),
                )
            }
            GatewayError::Config(reason) => {
                tracing::error!(%reason, "configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new("configuration_error", "Service misconfigured"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::Cache(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Transport(format!("timeout: {err}"))
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}
