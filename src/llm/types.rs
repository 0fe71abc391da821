//! Shared types for provider adapters

use crate::storage::{ChatFile, ChatModel, Session};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A normalized message sent upstream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip)]
    pub token_count: i64,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        let token_count = super::tokens::message_tokens(&content);
        Self {
            role,
            content,
            token_count,
        }
    }
}

/// Per-request context passed explicitly into every adapter call
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// A context that is never cancelled by anything but the caller
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }
}

/// Everything an adapter needs for one upstream call
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub session: Session,
    pub model: ChatModel,
    pub messages: Vec<ChatMessage>,
    pub files: Vec<ChatFile>,
    pub anchor_uuid: String,
    pub regenerate: bool,
    pub stream: bool,
    /// Provider base URL derived from the catalog entry
    pub base_url: String,
}

impl AdapterRequest {
    /// Number of candidates requested (`n`), never below one
    pub fn candidates(&self) -> i64 {
        self.session.n.max(1)
    }

    pub fn max_tokens(&self) -> i64 {
        if self.session.max_tokens > 0 {
            self.session.max_tokens
        } else if self.model.default_token > 0 {
            self.model.default_token
        } else {
            4096
        }
    }
}

/// Final answer produced by an adapter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmAnswer {
    pub answer_id: String,
    pub answer: String,
    pub reasoning: String,
}

impl LlmAnswer {
    /// Form persisted in the assistant message
    pub fn stored_content(&self) -> String {
        if self.reasoning.is_empty() {
            self.answer.clone()
        } else {
            format!("<think>\n\n{}\n\n</think>\n\n{}", self.reasoning, self.answer)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.answer.is_empty() && self.reasoning.is_empty()
    }
}

/// Stable answer identifier, chosen once per request
#[derive(Debug, Clone)]
pub struct AnswerId {
    id: String,
    locked: bool,
}

impl AnswerId {
    pub fn for_request(req: &AdapterRequest) -> Self {
        if req.regenerate && !req.anchor_uuid.is_empty() {
            Self {
                id: req.anchor_uuid.clone(),
                locked: true,
            }
        } else {
            Self {
                id: uuid::Uuid::new_v4().to_string(),
                locked: false,
            }
        }
    }

    /// Take the provider's id from its first chunk, unless already fixed
    pub fn adopt(&mut self, provider_id: Option<&str>) {
        if !self.locked {
            if let Some(id) = provider_id.filter(|id| !id.is_empty()) {
                self.id = id.trim_start_matches("chatcmpl-").to_string();
            }
            self.locked = true;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

/// Accumulates content per candidate index plus a reasoning channel
#[derive(Debug, Clone, Default)]
pub struct CandidateBuffers {
    content: BTreeMap<usize, String>,
    reasoning: String,
}

impl CandidateBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, text: &str) {
        self.content.entry(index).or_default().push_str(text);
    }

    pub fn push_reasoning(&mut self, text: &str) {
        self.reasoning.push_str(text);
    }

    /// Replace the accumulated content of one candidate
    pub fn set(&mut self, index: usize, text: &str) {
        self.content.insert(index, text.to_string());
    }

    pub fn get(&self, index: usize) -> &str {
        self.content.get(&index).map(String::as_str).unwrap_or("")
    }

    /// Single candidates are returned as-is; several are numbered sections
    pub fn answer(&self) -> String {
        if self.content.len() <= 1 {
            return self.content.values().next().cloned().unwrap_or_default();
        }
        self.content
            .iter()
            .map(|(index, text)| format!("## {}\n\n{}", index + 1, text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn finish(self, answer_id: &AnswerId) -> LlmAnswer {
        LlmAnswer {
            answer_id: answer_id.as_str().to_string(),
            answer: self.answer(),
            reasoning: self.reasoning,
        }
    }
}

/// One normalized increment written towards the client
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub answer_id: String,
    pub index: usize,
    pub content: String,
    pub reasoning: Option<String>,
}

impl Delta {
    pub fn content(answer_id: &AnswerId, index: usize, content: impl Into<String>) -> Self {
        Self {
            answer_id: answer_id.as_str().to_string(),
            index,
            content: content.into(),
            reasoning: None,
        }
    }

    pub fn reasoning(answer_id: &AnswerId, index: usize, reasoning: impl Into<String>) -> Self {
        Self {
            answer_id: answer_id.as_str().to_string(),
            index,
            content: String::new(),
            reasoning: Some(reasoning.into()),
        }
    }
}

#[derive(Debug, Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Where adapters write deltas; the SSE emitter is the main implementation
#[async_trait]
pub trait DeltaSink: Send {
    async fn send(&mut self, delta: Delta) -> Result<(), SinkClosed>;
}

/// Sink for non-streaming calls and background enrichment
#[derive(Debug, Default)]
pub struct DiscardSink;

#[async_trait]
impl DeltaSink for DiscardSink {
    async fn send(&mut self, _delta: Delta) -> Result<(), SinkClosed> {
        Ok(())
    }
}

/// Wraps another sink and keeps what was actually forwarded
///
/// Used to save a partial answer when an adapter fails after streaming began.
pub struct RecordingSink<'a> {
    inner: &'a mut dyn DeltaSink,
    buffers: CandidateBuffers,
    answer_id: Option<String>,
}

impl<'a> RecordingSink<'a> {
    pub fn new(inner: &'a mut dyn DeltaSink) -> Self {
        Self {
            inner,
            buffers: CandidateBuffers::new(),
            answer_id: None,
        }
    }

    /// What the client has seen so far
    pub fn recorded(&self) -> Option<LlmAnswer> {
        let answer_id = self.answer_id.clone()?;
        Some(LlmAnswer {
            answer_id,
            answer: self.buffers.answer(),
            reasoning: self.buffers.reasoning.clone(),
        })
    }
}

#[async_trait]
impl DeltaSink for RecordingSink<'_> {
    async fn send(&mut self, delta: Delta) -> Result<(), SinkClosed> {
        self.inner.send(delta.clone()).await?;
        self.answer_id.get_or_insert(delta.answer_id);
        self.buffers.push(delta.index, &delta.content);
        if let Some(reasoning) = &delta.reasoning {
            self.buffers.push_reasoning(reasoning);
        }
        Ok(())
    }
}

/// Streaming chunk as written to clients (OpenAI chunk shape)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkDelta {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(rename = "suggestedQuestions", skip_serializing_if = "Option::is_none")]
    pub suggested_questions: Option<Vec<String>>,
}

impl ChatCompletionChunk {
    pub fn new(id: &str, model: &str, choice: ChunkChoice) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![choice],
        }
    }

    pub fn from_delta(delta: &Delta, model: &str) -> Self {
        Self::new(
            &delta.answer_id,
            model,
            ChunkChoice {
                index: delta.index,
                delta: ChunkDelta {
                    content: delta.content.clone(),
                    reasoning_content: delta.reasoning.clone(),
                    suggested_questions: None,
                },
                finish_reason: None,
            },
        )
    }
}

/// Non-streaming response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub usage: Usage,
    pub choices: Vec<ResponseChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub message: ResponseMessage,
    pub finish_reason: String,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: Role,
    pub content: String,
}

impl ChatCompletionResponse {
    pub fn from_answer(answer: &LlmAnswer, model: &str, prompt_tokens: i64) -> Self {
        let completion_tokens = super::tokens::count_tokens(&answer.answer);
        Self {
            id: answer.answer_id.clone(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            choices: vec![ResponseChoice {
                message: ResponseMessage {
                    role: Role::Assistant,
                    content: answer.stored_content(),
                },
                finish_reason: "stop".to_string(),
                index: 0,
            }],
        }
    }
}
