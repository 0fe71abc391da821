//! OpenAI chat-completions adapter
//!
//! Also serves Azure OpenAI deployments and OpenAI-compatible gateways
//! (DeepSeek, Yi and friends) through the reverse-proxy setting.

use super::client::{self, authorize};
use super::{
    forward, AdapterDeps, AdapterRequest, AnswerId, CandidateBuffers, ChatAdapter, ChatMessage,
    Delta, DeltaSink, LlmAnswer, LlmError, RequestContext, Role,
};
use crate::storage::ChatFile;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::streaming::UpstreamLines;

const AZURE_AUTH_HEADER: &str = "api-key";

/// MIME types sent inline as data URLs instead of pasted text
const INLINE_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/heic",
    "image/heif",
    "audio/wav",
    "audio/mp3",
    "audio/aiff",
    "audio/aac",
    "audio/ogg",
    "audio/flac",
    "video/mp4",
    "video/mpeg",
    "video/mov",
    "video/avi",
    "video/x-flv",
    "video/mpg",
    "video/webm",
    "video/wmv",
    "video/3gpp",
];

pub struct OpenAiAdapter {
    deps: AdapterDeps,
}

impl OpenAiAdapter {
    pub fn new(deps: AdapterDeps) -> Self {
        Self { deps }
    }

    fn azure_resource(&self) -> Option<&str> {
        self.deps
            .upstream
            .azure_resource_name
            .as_deref()
            .filter(|r| !r.is_empty())
    }

    fn endpoint(&self, req: &AdapterRequest) -> String {
        let upstream = &self.deps.upstream;
        if let Some(resource) = self.azure_resource() {
            let deployment = if req.session.model == "gpt-3.5-turbo" {
                resource
            } else {
                req.session.model.as_str()
            };
            return format!(
                "https://{resource}.openai.azure.com/openai/deployments/{deployment}/chat/completions?api-version={}",
                upstream.azure_api_version
            );
        }
        let base = match upstream.reverse_proxy.as_deref().filter(|p| !p.is_empty()) {
            Some(proxy) => proxy,
            None => req.base_url.as_str(),
        };
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    fn build_http_request(
        &self,
        req: &AdapterRequest,
    ) -> Result<reqwest::RequestBuilder, LlmError> {
        let body = build_request(req);
        let builder = self
            .deps
            .clients
            .openai
            .post(self.endpoint(req))
            .timeout(self.deps.clients.timeout_for(&req.model))
            .json(&body);

        if self.azure_resource().is_some() {
            let mut model = req.model.clone();
            model.api_auth_header = AZURE_AUTH_HEADER.to_string();
            authorize(builder, &model, self.deps.secrets.as_ref(), AZURE_AUTH_HEADER)
        } else {
            authorize(builder, &req.model, self.deps.secrets.as_ref(), "Authorization")
        }
    }
}

#[async_trait]
impl ChatAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        sink: &mut dyn DeltaSink,
        req: &AdapterRequest,
    ) -> Result<LlmAnswer, LlmError> {
        let mut answer_id = AnswerId::for_request(req);
        let mut buffers = CandidateBuffers::new();

        if !self.deps.limiter.acquire(&ctx.cancel).await {
            return Ok(buffers.finish(&answer_id));
        }

        let builder = self.build_http_request(req)?;
        let Some(response) = client::send(ctx, builder).await? else {
            return Ok(buffers.finish(&answer_id));
        };

        if !req.stream {
            let Some(completion) = client::read_json::<CompletionResponse>(ctx, response).await?
            else {
                return Ok(buffers.finish(&answer_id));
            };
            answer_id.adopt(completion.id.as_deref());
            for choice in completion.choices {
                if let Some(reasoning) = choice.message.reasoning_content {
                    buffers.push_reasoning(&reasoning);
                }
                buffers.push(choice.index, choice.message.content.as_deref().unwrap_or(""));
            }
            return Ok(buffers.finish(&answer_id));
        }

        let mut lines = UpstreamLines::sse(response, self.deps.upstream.max_stream_iterations);
        while let Some(line) = lines.next(&ctx.cancel).await? {
            if line == "[DONE]" {
                lines.stop();
                break;
            }
            let chunk: StreamChunk = match serde_json::from_str(&line) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!("Skipping undecodable OpenAI chunk: {}", e);
                    continue;
                }
            };
            if let Some(error) = chunk.error {
                return Err(LlmError::Provider(error.message));
            }
            answer_id.adopt(chunk.id.as_deref());

            for choice in chunk.choices {
                if let Some(reasoning) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
                    buffers.push_reasoning(&reasoning);
                    let delta = Delta::reasoning(&answer_id, choice.index, reasoning);
                    if !forward(sink, delta).await {
                        return Ok(buffers.finish(&answer_id));
                    }
                }
                if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                    buffers.push(choice.index, &content);
                    let delta = Delta::content(&answer_id, choice.index, content);
                    if !forward(sink, delta).await {
                        return Ok(buffers.finish(&answer_id));
                    }
                }
            }
        }

        tracing::debug!(answer_id = answer_id.as_str(), reason = ?lines.stop_reason(), "OpenAI stream finished");
        Ok(buffers.finish(&answer_id))
    }
}

/// Request body as it would be sent to an OpenAI-compatible endpoint
pub(crate) fn build_request(req: &AdapterRequest) -> OpenAiRequest {
    let mut messages: Vec<OpenAiMessage> = req.messages.iter().map(OpenAiMessage::text).collect();

    if !req.files.is_empty() {
        if let Some(first_user) = messages.iter_mut().find(|m| m.role == Role::User) {
            first_user.attach(&req.files);
        }
    }

    let max_tokens = req.max_tokens();
    OpenAiRequest {
        model: req.session.model.clone(),
        messages,
        temperature: req.session.temperature,
        top_p: (req.session.top_p - 0.01).max(0.0),
        n: req.candidates(),
        max_tokens: (max_tokens > 0).then_some(max_tokens),
        stream: req.stream,
    }
}

fn file_part(file: &ChatFile) -> OpenAiPart {
    if INLINE_MIME_TYPES.contains(&file.mime_type.as_str()) {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&file.data);
        OpenAiPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{};base64,{}", file.mime_type, encoded),
            },
        }
    } else {
        OpenAiPart::Text {
            text: format!(
                "file: {}\n<<<{}>>>\n",
                file.name,
                String::from_utf8_lossy(&file.data)
            ),
        }
    }
}

// OpenAI API request/response types

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    temperature: f64,
    top_p: f64,
    n: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: Role,
    content: OpenAiContent,
}

impl OpenAiMessage {
    fn text(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: OpenAiContent::Text(message.content.clone()),
        }
    }

    fn attach(&mut self, files: &[ChatFile]) {
        let text = match &self.content {
            OpenAiContent::Text(text) => text.clone(),
            OpenAiContent::Parts(_) => return,
        };
        let mut parts = vec![OpenAiPart::Text { text }];
        parts.extend(files.iter().map(file_part));
        self.content = OpenAiContent::Parts(parts);
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OpenAiPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    index: usize,
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
}
