//! Outbound HTTP plumbing shared by the adapters
//!
//! SECURITY: secrets are looked up by environment-variable name on every
//! call and only attached to the endpoint of the catalog entry that names
//! them. Nothing caches a secret across requests.

use super::{LlmError, RequestContext};
use crate::config::UpstreamConfig;
use crate::storage::ChatModel;
use std::collections::HashMap;
use std::time::Duration;

/// Resolves secret names (catalog `api_auth_key`) to values
pub trait SecretSource: Send + Sync {
    fn secret(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment at call time
#[derive(Debug, Default, Clone)]
pub struct EnvSecrets;

impl SecretSource for EnvSecrets {
    fn secret(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed secrets, for tests and embedding
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets(pub HashMap<String, String>);

impl StaticSecrets {
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }
}

impl SecretSource for StaticSecrets {
    fn secret(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

/// HTTP clients for upstream calls
///
/// OpenAI-style traffic gets its own client so the optional SOCKS proxy
/// applies only there.
#[derive(Debug, Clone)]
pub struct HttpClients {
    pub plain: reqwest::Client,
    pub openai: reqwest::Client,
    default_timeout: Duration,
}

impl HttpClients {
    pub fn new(config: &UpstreamConfig) -> Result<Self, LlmError> {
        let default_timeout = Duration::from_secs(config.timeout_secs.max(1));
        let plain = reqwest::Client::builder()
            .timeout(default_timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        let mut openai = reqwest::Client::builder().timeout(default_timeout);
        if let Some(proxy_url) = config.socks_proxy_url() {
            tracing::info!("Routing OpenAI traffic through {}", proxy_url);
            let proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| LlmError::Config(format!("invalid SOCKS proxy: {e}")))?;
            openai = openai.proxy(proxy);
        }
        let openai = openai
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        Ok(Self {
            plain,
            openai,
            default_timeout,
        })
    }

    /// Per-model timeout override, else the client default
    pub fn timeout_for(&self, model: &ChatModel) -> Duration {
        if model.http_timeout_secs > 0 {
            Duration::from_secs(model.http_timeout_secs)
        } else {
            self.default_timeout
        }
    }
}

/// Attach the catalog entry's credential to `builder`
///
/// `Authorization` gets a `Bearer` prefix; any other header carries the raw
/// secret. Entries without a key name are sent unauthenticated.
pub fn authorize(
    builder: reqwest::RequestBuilder,
    model: &ChatModel,
    secrets: &dyn SecretSource,
    default_header: &str,
) -> Result<reqwest::RequestBuilder, LlmError> {
    if model.api_auth_key.is_empty() {
        return Ok(builder);
    }
    let secret = secrets.secret(&model.api_auth_key).ok_or_else(|| {
        LlmError::Config(format!(
            "environment variable {} is not set for model {}",
            model.api_auth_key, model.name
        ))
    })?;
    let header = if model.api_auth_header.is_empty() {
        default_header
    } else {
        model.api_auth_header.as_str()
    };
    if header.eq_ignore_ascii_case("authorization") {
        Ok(builder.header(reqwest::header::AUTHORIZATION, format!("Bearer {secret}")))
    } else {
        Ok(builder.header(header, secret))
    }
}

/// Send a request, racing the request's cancellation token
///
/// Returns `Ok(None)` when cancelled before the response headers arrived,
/// and maps non-success statuses to [`LlmError::Upstream`].
pub async fn send(
    ctx: &RequestContext,
    builder: reqwest::RequestBuilder,
) -> Result<Option<reqwest::Response>, LlmError> {
    let response = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Ok(None),
        result = builder.send() => result.map_err(LlmError::from_reqwest)?,
    };

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        return Err(LlmError::from_http_status(status, error_text));
    }
    Ok(Some(response))
}

/// Read a whole JSON body, racing cancellation
pub async fn read_json<T: serde::de::DeserializeOwned>(
    ctx: &RequestContext,
    response: reqwest::Response,
) -> Result<Option<T>, LlmError> {
    let text = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Ok(None),
        text = response.text() => text.map_err(LlmError::from_reqwest)?,
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| LlmError::Parse(format!("{e}: {}", text.chars().take(200).collect::<String>())))
}
