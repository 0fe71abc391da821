//! Custom completion-style adapter
//!
//! Speaks the legacy `prompt`/`completion` dialect where every event carries
//! the whole completion so far. Deltas are computed here so callers only
//! ever see increments.

use super::client::{self, authorize};
use super::streaming::UpstreamLines;
use super::{
    forward, AdapterDeps, AdapterRequest, AnswerId, CandidateBuffers, ChatAdapter, ChatMessage,
    Delta, DeltaSink, LlmAnswer, LlmError, RequestContext, Role,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const STOP_SEQUENCE: &str = "\n\nHuman:";

pub struct CustomAdapter {
    deps: AdapterDeps,
}

impl CustomAdapter {
    pub fn new(deps: AdapterDeps) -> Self {
        Self { deps }
    }
}

/// Flatten a conversation into a single Human/Assistant prompt
pub(crate) fn flatten_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Assistant => format!("{}\n", m.content),
            Role::User | Role::System => format!("\n\nHuman: {}\n\nAssistant: ", m.content),
        })
        .collect()
}

/// What is new in `current` relative to `previous`
///
/// A snapshot that rewrites earlier text is returned whole.
pub(crate) fn completion_delta<'a>(previous: &str, current: &'a str) -> &'a str {
    match current.strip_prefix(previous) {
        Some(suffix) => suffix,
        None => current,
    }
}

#[async_trait]
impl ChatAdapter for CustomAdapter {
    fn name(&self) -> &'static str {
        "custom"
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

        let body = CustomRequest {
            prompt: flatten_prompt(&req.messages),
            model: req.session.model.clone(),
            max_tokens_to_sample: req.max_tokens(),
            temperature: req.session.temperature,
            stop_sequences: vec![STOP_SEQUENCE.to_string()],
            stream: true,
        };
        let builder = self
            .deps
            .clients
            .plain
            .post(&req.model.url)
            .timeout(self.deps.clients.timeout_for(&req.model))
            .json(&body);
        let builder = authorize(builder, &req.model, self.deps.secrets.as_ref(), "Authorization")?;

        let Some(response) = client::send(ctx, builder).await? else {
            return Ok(buffers.finish(&answer_id));
        };

        let mut lines = UpstreamLines::sse(response, self.deps.upstream.max_stream_iterations);
        while let Some(line) = lines.next(&ctx.cancel).await? {
            if line == "[DONE]" {
                lines.stop();
                break;
            }
            let event: CustomEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!("Skipping undecodable completion event: {}", e);
                    continue;
                }
            };
            if let Some(error) = event.error {
                return Err(LlmError::Provider(error.message));
            }

            let delta = completion_delta(buffers.get(0), &event.completion).to_string();
            buffers.set(0, &event.completion);
            if !delta.is_empty() && req.stream && !forward(sink, Delta::content(&answer_id, 0, delta)).await
            {
                break;
            }
            if event.stop_reason.is_some() {
                lines.stop();
                break;
            }
        }

        Ok(buffers.finish(&answer_id))
    }
}

// Completion API request/response types

#[derive(Debug, Serialize)]
struct CustomRequest {
    prompt: String,
    model: String,
    max_tokens_to_sample: i64,
    temperature: f64,
    stop_sequences: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CustomEvent {
    #[serde(default)]
    completion: String,
    stop_reason: Option<String>,
    error: Option<CustomError>,
}

#[derive(Debug, Deserialize)]
struct CustomError {
    #[serde(default)]
    message: String,
}
