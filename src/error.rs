use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::auth::AuthError;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug)]
pub enum GatewayError {
    Auth(AuthError),
    Validation(String),
    PayloadTooLarge,
    RouteNotFound,
    ServiceNotFound(String),
    RateLimited { retry_after_secs: u64 },
    CircuitOpen { service: String, retry_after_secs: u64 },
    UpstreamTimeout { service: String },
    UpstreamUnreachable { service: String },
    Conflict(String),
    StoreUnavailable(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(err) => err.code(),
            Self::Validation(_) => "validation_error",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RouteNotFound => "route_not_found",
            Self::ServiceNotFound(_) => "service_not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamUnreachable { .. } => "upstream_unreachable",
            Self::Conflict(_) => "conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Auth(err) => err.message(),
            Self::Validation(msg) => msg.clone(),
            Self::PayloadTooLarge => "Request body exceeds configured limit".to_string(),
            Self::RouteNotFound => "No route matched the request".to_string(),
            Self::ServiceNotFound(service) => format!("Service '{service}' not found"),
            Self::RateLimited { .. } => "Rate limit exceeded".to_string(),
            Self::CircuitOpen { service, .. } => {
                format!("Service '{service}' is temporarily unavailable")
            }
            Self::UpstreamTimeout { service } => {
                format!("Upstream service '{service}' timed out")
            }
            Self::UpstreamUnreachable { service } => {
                format!("Cannot connect to service '{service}'")
            }
            Self::Conflict(msg) => msg.clone(),
            Self::StoreUnavailable(msg) => format!("Shared store unavailable: {msg}"),
            Self::Internal(msg) => msg.clone(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(err) => err.status(),
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RouteNotFound | Self::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::StoreUnavailable(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs }
            | Self::CircuitOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after_secs();

        let mut response = (status, Json(ErrorBody {
            error: self.code(),
            message: self.message(),
        }))
            .into_response();

        if let Some(secs) = retry_after
            && let Ok(v) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        if !response.headers().contains_key(header::CONTENT_TYPE) {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        response
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}
