//! Client-facing error catalog
//!
//! Every failure that reaches a client carries a short stable `code` from
//! [`ErrorCode`]. Clients localize on the code, not on the message.
//! `debug_info` is kept for logs only and never serialized.

use crate::llm::LlmError;
use crate::storage::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Published error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    TokenExpired,
    InvalidToken,
    NotFound,
    Conflict,
    InvalidInput,
    SystemOnly,
    TooManyTokens,
    RateLimitUser,
    RateLimitModel,
    ModelAccessDenied,
    ModelNotFound,
    UpstreamFailed,
    UpstreamTimeout,
    UpstreamMalformed,
    UpstreamReported,
    Storage,
    Internal,
    StreamUnsupported,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "AUTH_001",
            ErrorCode::Forbidden => "AUTH_002",
            ErrorCode::TokenExpired => "AUTH_003",
            ErrorCode::InvalidToken => "AUTH_004",
            ErrorCode::NotFound => "RES_001",
            ErrorCode::Conflict => "RES_002",
            ErrorCode::InvalidInput => "VALD_001",
            ErrorCode::SystemOnly => "VALD_002",
            ErrorCode::TooManyTokens => "VALD_003",
            ErrorCode::RateLimitUser => "RATE_001",
            ErrorCode::RateLimitModel => "RATE_002",
            ErrorCode::ModelAccessDenied => "RATE_003",
            ErrorCode::ModelNotFound => "MODEL_001",
            ErrorCode::UpstreamFailed => "MODEL_002",
            ErrorCode::UpstreamTimeout => "MODEL_003",
            ErrorCode::UpstreamMalformed => "MODEL_004",
            ErrorCode::UpstreamReported => "MODEL_005",
            ErrorCode::Storage => "DB_001",
            ErrorCode::Internal => "INTN_001",
            ErrorCode::StreamUnsupported => "INTN_002",
            ErrorCode::Cancelled => "CTX_001",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized | ErrorCode::TokenExpired | ErrorCode::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            ErrorCode::Forbidden | ErrorCode::ModelAccessDenied => StatusCode::FORBIDDEN,
            ErrorCode::NotFound | ErrorCode::ModelNotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::InvalidInput | ErrorCode::SystemOnly => StatusCode::BAD_REQUEST,
            ErrorCode::TooManyTokens => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::RateLimitUser | ErrorCode::RateLimitModel => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::UpstreamFailed
            | ErrorCode::UpstreamMalformed
            | ErrorCode::UpstreamReported => StatusCode::BAD_GATEWAY,
            ErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Storage | ErrorCode::Internal | ErrorCode::StreamUnsupported => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCode::Cancelled => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// Default human-readable message
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "Authentication required",
            ErrorCode::Forbidden => "Access denied",
            ErrorCode::TokenExpired => "Token expired",
            ErrorCode::InvalidToken => "Invalid token",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::Conflict => "Resource already exists",
            ErrorCode::InvalidInput => "Invalid input provided",
            ErrorCode::SystemOnly => "No user message to answer",
            ErrorCode::TooManyTokens => "Conversation exceeds the model token limit",
            ErrorCode::RateLimitUser => "Rate limit exceeded",
            ErrorCode::RateLimitModel => "Model rate limit exceeded",
            ErrorCode::ModelAccessDenied => "Model access denied",
            ErrorCode::ModelNotFound => "Model not found or unavailable",
            ErrorCode::UpstreamFailed => "Model request failed",
            ErrorCode::UpstreamTimeout => "Model request timed out",
            ErrorCode::UpstreamMalformed => "Model response could not be parsed",
            ErrorCode::UpstreamReported => "Model reported an error",
            ErrorCode::Storage => "Storage failure",
            ErrorCode::Internal => "Internal server error",
            ErrorCode::StreamUnsupported => "Streaming unsupported by client",
            ErrorCode::Cancelled => "Request canceled",
        }
    }
}

/// Error returned to clients, either as a JSON body or as a terminal SSE event
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", code.as_str())]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub detail: Option<String>,
    /// Logged, never serialized
    pub debug_info: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

impl ApiError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.message().to_string(),
            detail: None,
            debug_info: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_debug_info(mut self, info: impl Into<String>) -> Self {
        self.debug_info = Some(info.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    /// Text written into the content of a terminal SSE error chunk
    pub fn stream_text(&self) -> String {
        match &self.detail {
            Some(detail) => format!("[ERROR] {}: {} ({})", self.code.as_str(), self.message, detail),
            None => format!("[ERROR] {}: {}", self.code.as_str(), self.message),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(ErrorBody {
            code: self.code.as_str(),
            message: &self.message,
            detail: self.detail.as_deref(),
        })
        .unwrap_or_else(|_| serde_json::json!({ "code": self.code.as_str() }))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(info) = &self.debug_info {
            tracing::warn!(code = self.code.as_str(), debug = %info, "{}", self.message);
        }
        (self.status(), Json(self.to_json())).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(entity) => {
                ApiError::new(ErrorCode::NotFound).with_detail(format!("{entity} not found"))
            }
            StoreError::Cancelled => ApiError::new(ErrorCode::Cancelled),
            StoreError::Backend(e) => {
                ApiError::new(ErrorCode::Storage).with_debug_info(format!("{e:#}"))
            }
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        match &err {
            LlmError::Upstream { status, .. } => ApiError::new(ErrorCode::UpstreamFailed)
                .with_detail(format!("upstream status {status}"))
                .with_debug_info(err.to_string()),
            LlmError::Timeout(_) => {
                ApiError::new(ErrorCode::UpstreamTimeout).with_debug_info(err.to_string())
            }
            LlmError::Parse(_) => {
                ApiError::new(ErrorCode::UpstreamMalformed).with_debug_info(err.to_string())
            }
            LlmError::Provider(message) => {
                ApiError::new(ErrorCode::UpstreamReported).with_detail(message.clone())
            }
            LlmError::Network(_) | LlmError::Config(_) => {
                ApiError::new(ErrorCode::UpstreamFailed).with_debug_info(err.to_string())
            }
            LlmError::Cancelled => ApiError::new(ErrorCode::Cancelled),
            LlmError::Other(_) => {
                ApiError::new(ErrorCode::Internal).with_debug_info(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_maps_to_429() {
        let err = ApiError::new(ErrorCode::RateLimitUser);
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = err.to_json();
        assert_eq!(body["code"], "RATE_001");
        assert_eq!(body["message"], "Rate limit exceeded");
        assert!(body.get("detail").is_none());
    }

    #[test]
    fn test_debug_info_is_not_serialized() {
        let err = ApiError::new(ErrorCode::Storage).with_debug_info("disk I/O error");
        let body = err.to_json().to_string();
        assert!(!body.contains("disk I/O"));
        assert!(!body.contains("debug"));
    }

    #[test]
    fn test_store_not_found_is_res_001() {
        let err: ApiError = StoreError::NotFound("session").into();
        assert_eq!(err.code.as_str(), "RES_001");
        assert_eq!(err.detail.as_deref(), Some("session not found"));
    }

    #[test]
    fn test_provider_error_keeps_upstream_message() {
        let err: ApiError = LlmError::Provider("overloaded".into()).into();
        assert_eq!(err.code, ErrorCode::UpstreamReported);
        assert_eq!(
            err.stream_text(),
            "[ERROR] MODEL_005: Model reported an error (overloaded)"
        );
    }

    #[test]
    fn test_every_code_is_unique() {
        use std::collections::HashSet;
        let all = [
            ErrorCode::Unauthorized,
            ErrorCode::Forbidden,
            ErrorCode::TokenExpired,
            ErrorCode::InvalidToken,
            ErrorCode::NotFound,
            ErrorCode::Conflict,
            ErrorCode::InvalidInput,
            ErrorCode::SystemOnly,
            ErrorCode::TooManyTokens,
            ErrorCode::RateLimitUser,
            ErrorCode::RateLimitModel,
            ErrorCode::ModelAccessDenied,
            ErrorCode::ModelNotFound,
            ErrorCode::UpstreamFailed,
            ErrorCode::UpstreamTimeout,
            ErrorCode::UpstreamMalformed,
            ErrorCode::UpstreamReported,
            ErrorCode::Storage,
            ErrorCode::Internal,
            ErrorCode::StreamUnsupported,
            ErrorCode::Cancelled,
        ];
        let codes: HashSet<_> = all.iter().map(|c| c.as_str()).collect();
        assert_eq!(codes.len(), all.len());
    }
}
