//! Typed errors for upstream provider calls
//!
//! Lets the pipeline map failures onto the client error catalog without
//! string matching.

use thiserror::Error;

/// Upstream call errors with typed variants
///
/// - `Upstream` - provider answered with a non-2xx status
/// - `Timeout` - the 5-minute client deadline (or a read deadline) elapsed
/// - `Network` - connection refused, reset, DNS, TLS
/// - `Parse` - a complete response body could not be decoded
/// - `Provider` - the provider reported an error inside the stream
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("Upstream timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed upstream response: {0}")]
    Parse(String),

    #[error("Provider error: {0}")]
    Provider(String),

    /// Missing credentials, bad URL and similar setup problems
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LlmError {
    /// Build from a non-success HTTP status and the response body
    pub fn from_http_status(status: reqwest::StatusCode, body: String) -> Self {
        LlmError::Upstream {
            status: status.as_u16(),
            body: truncate(&body, 2000),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else if err.is_decode() {
            LlmError::Parse(err.to_string())
        } else {
            LlmError::Network(err.to_string())
        }
    }

    /// Transient failures worth retrying after a delay
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Upstream { status, .. } => *status == 429 || *status >= 500,
            LlmError::Timeout(_) | LlmError::Network(_) => true,
            _ => false,
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
