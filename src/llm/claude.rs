//! Claude (Anthropic messages API) adapter
//!
//! SECURITY: the key is only sent to the endpoint configured on the model
//! catalog entry that names it.

use super::client::{self, authorize};
use super::streaming::UpstreamLines;
use super::{
    forward, AdapterDeps, AdapterRequest, AnswerId, CandidateBuffers, ChatAdapter, Delta,
    DeltaSink, LlmAnswer, LlmError, RequestContext, Role,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeAdapter {
    deps: AdapterDeps,
}

impl ClaudeAdapter {
    pub fn new(deps: AdapterDeps) -> Self {
        Self { deps }
    }
}

fn convert_messages(req: &AdapterRequest) -> (Option<String>, Vec<ClaudeMessage>) {
    let mut messages = req.messages.iter();
    let system = match req.messages.first() {
        Some(first) if first.role == Role::System => {
            messages.next();
            Some(first.content.clone())
        }
        _ => None,
    };

    let claude_messages = messages
        .skip_while(|m| m.role == Role::Assistant)
        .map(|m| ClaudeMessage {
            role: match m.role {
                Role::Assistant => "assistant",
                Role::User | Role::System => "user",
            }
            .to_string(),
            content: m.content.clone(),
        })
        .collect();

    (system, claude_messages)
}

fn build_request(req: &AdapterRequest) -> ClaudeRequest {
    let (system, messages) = convert_messages(req);
    ClaudeRequest {
        model: req.session.model.clone(),
        system,
        messages,
        max_tokens: req.max_tokens(),
        temperature: req.session.temperature,
        top_p: req.session.top_p,
        stream: req.stream,
    }
}

#[async_trait]
impl ChatAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn needs_user_turn(&self) -> bool {
        true
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        sink: &mut dyn DeltaSink,
        req: &AdapterRequest,
    ) -> Result<LlmAnswer, LlmError> {
        let mut answer_id = AnswerId::for_request(req);
        let mut buffers = CandidateBuffers::new();

        let builder = self
            .deps
            .clients
            .plain
            .post(&req.model.url)
            .timeout(self.deps.clients.timeout_for(&req.model))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&build_request(req));
        let builder = authorize(builder, &req.model, self.deps.secrets.as_ref(), "x-api-key")?;

        let Some(response) = client::send(ctx, builder).await? else {
            return Ok(buffers.finish(&answer_id));
        };

        if !req.stream {
            let Some(message) = client::read_json::<ClaudeResponse>(ctx, response).await? else {
                return Ok(buffers.finish(&answer_id));
            };
            answer_id.adopt(message.id.as_deref());
            if let Some(block) = message.content.first() {
                buffers.push(0, &block.text);
            }
            return Ok(buffers.finish(&answer_id));
        }

        let mut lines = UpstreamLines::sse(response, self.deps.upstream.max_stream_iterations);
        while let Some(line) = lines.next(&ctx.cancel).await? {
            let event: ClaudeEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!("Skipping undecodable Claude event: {}", e);
                    continue;
                }
            };

            let text = match event {
                ClaudeEvent::MessageStart { message } => {
                    answer_id.adopt(message.id.as_deref());
                    continue;
                }
                ClaudeEvent::ContentBlockStart { content_block } => content_block.text,
                ClaudeEvent::ContentBlockDelta { delta } => delta.text,
                ClaudeEvent::MessageStop => {
                    lines.stop();
                    break;
                }
                ClaudeEvent::Error { error } => {
                    let message = error.message.or(error.kind).unwrap_or_else(|| "unknown".into());
                    return Err(LlmError::Provider(message));
                }
                ClaudeEvent::Other => continue,
            };

            if text.is_empty() {
                continue;
            }
            answer_id.adopt(None);
            buffers.push(0, &text);
            if !forward(sink, Delta::content(&answer_id, 0, text)).await {
                break;
            }
        }

        Ok(buffers.finish(&answer_id))
    }
}

// Claude API request/response types

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ClaudeMessage>,
    max_tokens: i64,
    temperature: f64,
    top_p: f64,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    id: Option<String>,
    #[serde(default)]
    content: Vec<TextBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct TextBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClaudeEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { content_block: TextBlock },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: TextBlock },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: ClaudeErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaudeErrorBody {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}
