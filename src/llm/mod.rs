//! LLM provider adapters
//!
//! Every provider is reached through [`ChatAdapter`]. Adapters only see the
//! per-request context, the write-side [`DeltaSink`] and an
//! [`AdapterRequest`]; they never touch the store or the HTTP layer.

mod canned;
mod claude;
pub mod client;
mod custom;
mod error;
mod gemini;
pub mod limiter;
mod ollama;
mod openai;
mod registry;
pub mod streaming;
pub mod tokens;
mod types;

pub use canned::{is_test_marker, CannedAdapter, CANNED_ANSWER};
pub use claude::ClaudeAdapter;
pub use client::{EnvSecrets, HttpClients, SecretSource, StaticSecrets};
pub use custom::CustomAdapter;
pub use error::LlmError;
pub use gemini::GeminiAdapter;
pub use limiter::TokenBucket;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use registry::{AdapterDeps, AdapterRegistry, ApiType};
pub use types::*;

use async_trait::async_trait;

/// A provider that turns a normalized conversation into deltas and a final answer
///
/// Implementations write increments to `sink` as they arrive and return the
/// accumulated answer. Cancellation of `ctx` or a closed sink ends the call
/// early with whatever was collected; only upstream failures are errors.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when the first message travels as a separate system field and
    /// at least one further turn is required
    fn needs_user_turn(&self) -> bool {
        false
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        sink: &mut dyn DeltaSink,
        req: &AdapterRequest,
    ) -> Result<LlmAnswer, LlmError>;
}

/// Provider base URL from a catalog endpoint
///
/// Everything before the first `/chat/` segment, or the URL unchanged when
/// there is none.
pub fn base_url_for(url: &str) -> String {
    match url.find("/chat/") {
        Some(idx) => url[..idx].to_string(),
        None => url.to_string(),
    }
}

/// Forward one delta, reporting whether the client is still listening
pub(crate) async fn forward(sink: &mut dyn DeltaSink, delta: Delta) -> bool {
    match sink.send(delta).await {
        Ok(()) => true,
        Err(_) => {
            tracing::debug!("Client went away mid-stream, returning partial answer");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_truncates_at_chat_segment() {
        assert_eq!(
            base_url_for("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com/v1"
        );
        assert_eq!(
            base_url_for("http://127.0.0.1:9000/v1/messages"),
            "http://127.0.0.1:9000/v1/messages"
        );
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::storage::{ChatModel, Session};
    use std::sync::{Arc, Mutex};

    pub fn model(name: &str, api_type: &str, url: &str) -> ChatModel {
        ChatModel {
            name: name.into(),
            url: url.into(),
            api_auth_header: "Authorization".into(),
            api_auth_key: "TEST_KEY".into(),
            api_type: api_type.into(),
            default_token: 0,
            max_token: 0,
            enable_per_mode_ratelimit: false,
            http_timeout_secs: 0,
        }
    }

    pub fn request(model: ChatModel, messages: Vec<ChatMessage>) -> AdapterRequest {
        let session = Session::new("s-1", 1, model.name.clone());
        AdapterRequest {
            session,
            base_url: base_url_for(&model.url),
            model,
            messages,
            files: Vec::new(),
            anchor_uuid: String::new(),
            regenerate: false,
            stream: true,
        }
    }

    pub fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(Role::System, "You are terse."),
            ChatMessage::new(Role::User, "hello"),
        ]
    }

    /// Sink that keeps every delta for assertions
    #[derive(Clone, Default)]
    pub struct CollectSink(pub Arc<Mutex<Vec<Delta>>>);

    impl CollectSink {
        pub fn contents(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|d| d.content.clone()).collect()
        }

        pub fn deltas(&self) -> Vec<Delta> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeltaSink for CollectSink {
        async fn send(&mut self, delta: Delta) -> Result<(), SinkClosed> {
            self.0.lock().unwrap().push(delta);
            Ok(())
        }
    }

    /// Serve `body` with `content_type` for any POST, returning the base URL
    /// and the last request body seen
    pub async fn mock_upstream(
        content_type: &'static str,
        body: String,
    ) -> (String, Arc<Mutex<Option<(axum::http::HeaderMap, serde_json::Value)>>>) {
        use axum::{extract::State, http::HeaderMap, Router};

        type Seen = Arc<Mutex<Option<(HeaderMap, serde_json::Value)>>>;
        let seen: Seen = Arc::new(Mutex::new(None));
        let body = Arc::new(body);

        let app = Router::new()
            .fallback(
                move |State(seen): State<Seen>, headers: HeaderMap, payload: String| {
                    let body = body.clone();
                    async move {
                        let json: serde_json::Value =
                            serde_json::from_str(&payload).unwrap_or_default();
                        *seen.lock().unwrap() = Some((headers, json));
                        ([("content-type", content_type)], body.as_str().to_string())
                    }
                },
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    pub fn deps(config: crate::config::UpstreamConfig) -> AdapterDeps {
        AdapterDeps {
            clients: HttpClients::new(&config).unwrap(),
            secrets: Arc::new(StaticSecrets::default().with("TEST_KEY", "sk-test")),
            limiter: Arc::new(TokenBucket::new(100.0, 100)),
            upstream: config,
        }
    }
}
