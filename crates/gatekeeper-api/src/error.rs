//! Error taxonomy returned to API clients
//!
//! Every rejection carries a machine-readable [`ErrorCode`] so clients can
//! branch on it (retry after cooldown, upgrade plan, re-authenticate) without
//! parsing the message. Bodies have the shape `{error, code, status}`.

use crate::rate_limiting::RateLimitMetadata;
use axum::{
    http::{
        header::{HeaderName, HeaderValue},
        StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use gatekeeper_core::GatekeeperError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCredential,
    Unauthorized,
    TenantInactive,
    SubscriptionRequired,
    RateLimited,
    QuotaExceeded,
    InvalidRequest,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCredential => "INVALID_CREDENTIAL",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::TenantInactive => "TENANT_INACTIVE",
            ErrorCode::SubscriptionRequired => "SUBSCRIPTION_REQUIRED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidCredential | ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::TenantInactive => StatusCode::FORBIDDEN,
            ErrorCode::SubscriptionRequired => StatusCode::PAYMENT_REQUIRED,
            ErrorCode::RateLimited | ErrorCode::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of an error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
    pub status: u16,
}

/// A typed rejection, convertible straight into an HTTP response
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GateError {
    pub code: ErrorCode,
    pub message: String,
    /// Window state for the `X-RateLimit-*` headers, when known
    pub rate_limit: Option<RateLimitMetadata>,
    /// Seconds until the client may retry
    pub retry_after: Option<u64>,
}

impl GateError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            rate_limit: None,
            retry_after: None,
        }
    }

    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidCredential, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Client-facing message is generic; the detail belongs in the logs.
    pub fn internal(detail: impl fmt::Display) -> Self {
        tracing::error!(error = %detail, "Internal error while handling request");
        Self::new(
            ErrorCode::InternalError,
            "Internal server error. Please contact support with the request ID.",
        )
    }

    pub fn rate_limited(metadata: RateLimitMetadata, retry_after: u64) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            message: format!(
                "Rate limit of {} requests per minute exceeded. Retry after {} seconds.",
                metadata.limit, retry_after
            ),
            rate_limit: Some(metadata),
            retry_after: Some(retry_after),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }
}

impl From<GatekeeperError> for GateError {
    fn from(err: GatekeeperError) -> Self {
        match err {
            GatekeeperError::ValidationError(msg) => GateError::invalid_request(msg),
            GatekeeperError::ApiKeyNotFound(id) => {
                GateError::invalid_request(format!("API key not found: {}", id))
            }
            GatekeeperError::ConflictError(msg) => GateError::invalid_request(msg),
            other => GateError::internal(other),
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.message,
            code: self.code,
            status: status.as_u16(),
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        if let Some(metadata) = self.rate_limit {
            metadata.apply_headers(headers);
        }
        if let Some(retry_after) = self.retry_after {
            headers.insert(
                HeaderName::from_static("retry-after"),
                HeaderValue::from(retry_after),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::InvalidCredential.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::TenantInactive.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ErrorCode::SubscriptionRequired.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(ErrorCode::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::QuotaExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::InvalidRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::InternalError.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::SubscriptionRequired).unwrap();
        assert_eq!(json, "\"SUBSCRIPTION_REQUIRED\"");
        assert_eq!(ErrorCode::QuotaExceeded.to_string(), "QUOTA_EXCEEDED");
    }

    #[test]
    fn test_directory_errors_map_to_codes() {
        let err: GateError = GatekeeperError::ValidationError("bad slug".to_string()).into();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let err: GateError = GatekeeperError::Other("disk full".to_string()).into();
        assert_eq!(err.code, ErrorCode::InternalError);
        assert!(!err.message.contains("disk full"));
    }

    #[tokio::test]
    async fn test_rate_limited_response_has_headers_and_body() {
        let metadata = RateLimitMetadata {
            limit: 10,
            remaining: 0,
            reset: 1_700_000_040,
        };
        let response = GateError::rate_limited(metadata, 17).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "17");
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["x-ratelimit-reset"], "1700000040");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "RATE_LIMITED");
        assert_eq!(json["status"], 429);
        assert!(json["error"].as_str().unwrap().contains("17 seconds"));
    }
}
