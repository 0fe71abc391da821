//! Google Gemini adapter (`generateContent` / `streamGenerateContent`)

use super::client;
use super::streaming::UpstreamLines;
use super::{
    forward, AdapterDeps, AdapterRequest, AnswerId, CandidateBuffers, ChatAdapter, Delta,
    DeltaSink, LlmAnswer, LlmError, RequestContext, Role,
};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub struct GeminiAdapter {
    deps: AdapterDeps,
}

impl GeminiAdapter {
    pub fn new(deps: AdapterDeps) -> Self {
        Self { deps }
    }

    fn endpoint(&self, req: &AdapterRequest) -> Result<String, LlmError> {
        let key = if req.model.api_auth_key.is_empty() {
            String::new()
        } else {
            self.deps
                .secrets
                .secret(&req.model.api_auth_key)
                .ok_or_else(|| {
                    LlmError::Config(format!(
                        "environment variable {} is not set for model {}",
                        req.model.api_auth_key, req.model.name
                    ))
                })?
        };
        let method = if req.stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let raw = format!("{}:{method}", req.model.url.trim_end_matches('/'));
        let mut url = url::Url::parse(&raw)
            .map_err(|e| LlmError::Config(format!("invalid URL for model {}: {e}", req.model.name)))?;
        {
            let mut query = url.query_pairs_mut();
            if req.stream {
                query.append_pair("alt", "sse");
            }
            query.append_pair("key", &key);
        }
        Ok(url.into())
    }
}

fn build_request(req: &AdapterRequest) -> GeminiRequest {
    let mut contents: Vec<GeminiContent> = req
        .messages
        .iter()
        .map(|m| GeminiContent {
            role: match m.role {
                Role::Assistant => "model",
                Role::User | Role::System => "user",
            }
            .to_string(),
            parts: vec![GeminiPart::Text {
                text: m.content.clone(),
            }],
        })
        .collect();

    if !req.files.is_empty() {
        let first_user = req.messages.iter().position(|m| m.role == Role::User);
        if let Some(content) = first_user.and_then(|i| contents.get_mut(i)) {
            let engine = base64::engine::general_purpose::STANDARD;
            content
                .parts
                .extend(req.files.iter().map(|file| GeminiPart::InlineData {
                    inline_data: InlineData {
                        mime_type: file.mime_type.clone(),
                        data: engine.encode(&file.data),
                    },
                }));
        }
    }

    GeminiRequest {
        contents,
        generation_config: GenerationConfig {
            temperature: req.session.temperature,
            top_p: req.session.top_p,
            max_output_tokens: req.max_tokens(),
        },
    }
}

/// Text of the first candidate, parts concatenated
fn chunk_text(response: &GeminiResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ChatAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
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
            .post(self.endpoint(req)?)
            .timeout(self.deps.clients.timeout_for(&req.model))
            .json(&build_request(req));

        let Some(response) = client::send(ctx, builder).await? else {
            return Ok(buffers.finish(&answer_id));
        };

        if !req.stream {
            if let Some(body) = client::read_json::<GeminiResponse>(ctx, response).await? {
                if let Some(error) = body.error {
                    return Err(LlmError::Provider(error.message));
                }
                buffers.push(0, &chunk_text(&body));
            }
            return Ok(buffers.finish(&answer_id));
        }

        let mut lines = UpstreamLines::sse(response, self.deps.upstream.max_stream_iterations);
        while let Some(line) = lines.next(&ctx.cancel).await? {
            let chunk: GeminiResponse = match serde_json::from_str(&line) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::debug!("Skipping undecodable Gemini chunk: {}", e);
                    continue;
                }
            };
            if let Some(error) = chunk.error {
                return Err(LlmError::Provider(error.message));
            }
            let text = chunk_text(&chunk);
            if text.is_empty() {
                continue;
            }
            buffers.push(0, &text);
            if !forward(sink, Delta::content(&answer_id, 0, text)).await {
                break;
            }
        }

        Ok(buffers.finish(&answer_id))
    }
}

// Gemini API request/response types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    top_p: f64,
    max_output_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    message: String,
}
