//! Ollama adapter (`/api/chat`, newline-delimited JSON)

use super::client::{self, authorize};
use super::streaming::UpstreamLines;
use super::{
    forward, AdapterDeps, AdapterRequest, AnswerId, CandidateBuffers, ChatAdapter, Delta,
    DeltaSink, LlmAnswer, LlmError, RequestContext, Role,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const MODEL_PREFIX: &str = "ollama-";

pub struct OllamaAdapter {
    deps: AdapterDeps,
}

impl OllamaAdapter {
    pub fn new(deps: AdapterDeps) -> Self {
        Self { deps }
    }
}

fn build_request(req: &AdapterRequest) -> OllamaRequest {
    let model = req.session.model.as_str();
    OllamaRequest {
        model: model.strip_prefix(MODEL_PREFIX).unwrap_or(model).to_string(),
        messages: req
            .messages
            .iter()
            .map(|m| OllamaMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect(),
        stream: req.stream,
        options: OllamaOptions {
            temperature: req.session.temperature,
            top_p: req.session.top_p,
            num_predict: req.max_tokens(),
        },
    }
}

/// Some Ollama builds leak raw byte tokens for newlines
fn clean(text: &str) -> String {
    text.replace("<0x0A>", "\n")
}

#[async_trait]
impl ChatAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        sink: &mut dyn DeltaSink,
        req: &AdapterRequest,
    ) -> Result<LlmAnswer, LlmError> {
        let mut answer_id = AnswerId::for_request(req);
        answer_id.adopt(None);
        let mut buffers = CandidateBuffers::new();

        let builder = self
            .deps
            .clients
            .plain
            .post(&req.model.url)
            .timeout(self.deps.clients.timeout_for(&req.model))
            .json(&build_request(req));
        let builder = authorize(builder, &req.model, self.deps.secrets.as_ref(), "Authorization")?;

        let Some(response) = client::send(ctx, builder).await? else {
            return Ok(buffers.finish(&answer_id));
        };

        if !req.stream {
            if let Some(chunk) = client::read_json::<OllamaChunk>(ctx, response).await? {
                if let Some(error) = chunk.error {
                    return Err(LlmError::Provider(error));
                }
                if let Some(message) = chunk.message {
                    buffers.push(0, &clean(&message.content));
                }
            }
            return Ok(buffers.finish(&answer_id));
        }

        let mut lines = UpstreamLines::ndjson(response, self.deps.upstream.max_stream_iterations);
        while let Some(line) = lines.next(&ctx.cancel).await? {
            let chunk: OllamaChunk = match serde_json::from_str(&line) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!("Skipping undecodable Ollama line: {}", e);
                    continue;
                }
            };
            if let Some(error) = chunk.error {
                return Err(LlmError::Provider(error));
            }

            let text = chunk
                .message
                .map(|m| clean(&m.content))
                .unwrap_or_default();
            if !text.is_empty() {
                buffers.push(0, &text);
                if !forward(sink, Delta::content(&answer_id, 0, text)).await {
                    break;
                }
            }
            if chunk.done {
                lines.stop();
                break;
            }
        }

        Ok(buffers.finish(&answer_id))
    }
}

// Ollama API request/response types

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: Role,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
    top_p: f64,
    num_predict: i64,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::llm::fixtures::{self, CollectSink};

    fn ollama_model(url: &str) -> crate::storage::ChatModel {
        let mut model = fixtures::model("ollama-llama3", "ollama", &format!("{url}/api/chat"));
        model.api_auth_key = String::new();
        model
    }

    #[test]
    fn test_prefix_stripped_and_options() {
        let req = fixtures::request(ollama_model("http://x"), fixtures::conversation());
        let body = serde_json::to_value(build_request(&req)).unwrap();
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["options"]["num_predict"], 4096);
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn test_ndjson_until_done() {
        let body = [
            r#"{"message":{"role":"assistant","content":"line<0x0A>"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"next"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true}"#,
            r#"{"message":{"role":"assistant","content":"ignored"},"done":false}"#,
        ]
        .join("\n");
        let (url, seen) = fixtures::mock_upstream("application/x-ndjson", body).await;
        let adapter = OllamaAdapter::new(fixtures::deps(UpstreamConfig::default()));
        let req = fixtures::request(ollama_model(&url), fixtures::conversation());

        let mut sink = CollectSink::default();
        let answer = adapter
            .stream(&RequestContext::detached(), &mut sink, &req)
            .await
            .unwrap();
        assert_eq!(answer.answer, "line\nnext");
        assert_eq!(sink.contents(), vec!["line\n", "next"]);

        let (headers, _) = seen.lock().unwrap().clone().unwrap();
        assert!(headers.get("authorization").is_none());
    }
}
