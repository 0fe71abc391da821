//! Adapter selection by catalog `api_type`

use super::canned::{is_test_marker, CannedAdapter};
use super::{
    ChatAdapter, ChatMessage, ClaudeAdapter, CustomAdapter, GeminiAdapter, HttpClients,
    OllamaAdapter, OpenAiAdapter, SecretSource, TokenBucket,
};
use crate::config::UpstreamConfig;
use crate::storage::ChatModel;
use std::sync::Arc;

/// Provider families known to the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    OpenAi,
    Claude,
    Gemini,
    Ollama,
    Custom,
}

impl ApiType {
    /// Parse a catalog value; unknown values fall back to OpenAI
    pub fn from_catalog(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude3" | "anthropic" => ApiType::Claude,
            "gemini" | "google" => ApiType::Gemini,
            "ollama" => ApiType::Ollama,
            "custom" => ApiType::Custom,
            "openai" | "azure" => ApiType::OpenAi,
            other => {
                tracing::warn!("Unknown api_type '{}', using openai", other);
                ApiType::OpenAi
            }
        }
    }
}

/// Collaborators shared by all adapters
#[derive(Clone)]
pub struct AdapterDeps {
    pub clients: HttpClients,
    pub secrets: Arc<dyn SecretSource>,
    pub limiter: Arc<TokenBucket>,
    pub upstream: UpstreamConfig,
}

/// One instance of every adapter, built once at startup
pub struct AdapterRegistry {
    openai: Arc<dyn ChatAdapter>,
    claude: Arc<dyn ChatAdapter>,
    gemini: Arc<dyn ChatAdapter>,
    ollama: Arc<dyn ChatAdapter>,
    custom: Arc<dyn ChatAdapter>,
    canned: Arc<dyn ChatAdapter>,
}

impl AdapterRegistry {
    pub fn new(deps: AdapterDeps) -> Self {
        Self {
            openai: Arc::new(OpenAiAdapter::new(deps.clone())),
            claude: Arc::new(ClaudeAdapter::new(deps.clone())),
            gemini: Arc::new(GeminiAdapter::new(deps.clone())),
            ollama: Arc::new(OllamaAdapter::new(deps.clone())),
            custom: Arc::new(CustomAdapter::new(deps)),
            canned: Arc::new(CannedAdapter),
        }
    }

    /// Adapter for `model`, with the canned test adapter taking precedence
    /// when the conversation carries the demo marker
    pub fn select(&self, model: &ChatModel, messages: &[ChatMessage]) -> Arc<dyn ChatAdapter> {
        if is_test_marker(messages) {
            return self.canned.clone();
        }
        match ApiType::from_catalog(&model.api_type) {
            ApiType::OpenAi => self.openai.clone(),
            ApiType::Claude => self.claude.clone(),
            ApiType::Gemini => self.gemini.clone(),
            ApiType::Ollama => self.ollama.clone(),
            ApiType::Custom => self.custom.clone(),
        }
    }
}
