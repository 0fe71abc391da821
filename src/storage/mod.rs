//! Persistence port
//!
//! The chat pipeline reads sessions, prompts, messages, files and the model
//! catalog through [`ChatStore`], and writes back only prompts, messages and
//! session topics. Every operation takes an explicit cancellation token.

mod sqlite;

pub use sqlite::{SeedFile, SqliteStore};

use crate::llm::Role;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the persistence port
#[derive(Debug, Error)]
pub enum StoreError {
    /// Distinct sentinel so callers can branch without string inspection
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A conversation thread owned by one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub uuid: String,
    pub user_id: i64,
    pub model: String,
    /// Historical messages replayed upstream; 0 means the default
    pub max_length: i64,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: i64,
    pub n: i64,
    pub debug: bool,
    pub summarize_mode: bool,
    pub explore_mode: bool,
    pub topic: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Defaults for a fresh session, used by seeding and tests
    pub fn new(uuid: impl Into<String>, user_id: i64, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            uuid: uuid.into(),
            user_id,
            model: model.into(),
            max_length: 0,
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: 4096,
            n: 1,
            debug: false,
            summarize_mode: false,
            explore_mode: false,
            topic: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub uuid: String,
    pub session_uuid: String,
    pub role: Role,
    pub content: String,
    pub token_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub uuid: String,
    pub session_uuid: String,
    pub user_id: i64,
    pub role: Role,
    pub content: String,
    pub reasoning_content: String,
    pub token_count: i64,
    pub is_pin: bool,
    pub artifacts: Option<serde_json::Value>,
    pub suggested_questions: Vec<String>,
    /// Precomputed summary, written out-of-band
    pub summary: Option<String>,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Model catalog entry (administered out-of-band)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatModel {
    pub name: String,
    pub url: String,
    /// Header carrying the secret, e.g. `Authorization` or `x-api-key`
    pub api_auth_header: String,
    /// Name of the environment variable holding the secret
    pub api_auth_key: String,
    pub api_type: String,
    pub default_token: i64,
    pub max_token: i64,
    #[serde(default)]
    pub enable_per_mode_ratelimit: bool,
    /// Seconds; 0 means the upstream default
    #[serde(default)]
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrivilege {
    pub user_id: i64,
    pub model: String,
    pub rate_limit: i64,
}

#[derive(Debug, Clone)]
pub struct NewPrompt {
    pub session_uuid: String,
    pub user_id: i64,
    pub role: Role,
    pub content: String,
    pub token_count: i64,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub uuid: String,
    pub session_uuid: String,
    pub user_id: i64,
    pub role: Role,
    pub content: String,
    pub reasoning_content: String,
    pub token_count: i64,
    pub model: String,
}

/// Typed read/write operations consumed by the chat pipeline
///
/// Implementations must be safe for concurrent use; this is the only shared
/// mutable surface of the service.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn lookup_session(&self, cancel: &CancellationToken, uuid: &str)
        -> StoreResult<Session>;

    async fn lookup_model(&self, cancel: &CancellationToken, name: &str) -> StoreResult<ChatModel>;

    /// Prompts in creation order
    async fn list_session_prompts(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
    ) -> StoreResult<Vec<Prompt>>;

    /// The `limit` most recent messages, returned oldest-first
    async fn list_latest_messages(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>>;

    /// Up to `limit` messages strictly older than the anchor, oldest-first
    async fn list_messages_before(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
        anchor_uuid: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>>;

    async fn list_session_files(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
    ) -> StoreResult<Vec<ChatFile>>;

    async fn insert_prompt(&self, cancel: &CancellationToken, prompt: NewPrompt)
        -> StoreResult<Prompt>;

    async fn insert_message(
        &self,
        cancel: &CancellationToken,
        message: NewMessage,
    ) -> StoreResult<StoredMessage>;

    async fn update_message_content(
        &self,
        cancel: &CancellationToken,
        uuid: &str,
        content: &str,
        reasoning_content: &str,
        token_count: i64,
    ) -> StoreResult<()>;

    async fn update_message_suggestions(
        &self,
        cancel: &CancellationToken,
        uuid: &str,
        questions: &[String],
    ) -> StoreResult<()>;

    async fn update_message_artifacts(
        &self,
        cancel: &CancellationToken,
        uuid: &str,
        artifacts: &serde_json::Value,
    ) -> StoreResult<()>;

    async fn update_session_topic(
        &self,
        cancel: &CancellationToken,
        uuid: &str,
        topic: &str,
    ) -> StoreResult<()>;

    /// Messages written by this user within the trailing window
    async fn count_recent_messages(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        window: Duration,
    ) -> StoreResult<i64>;

    /// Per-user limit, `None` when the user has no explicit row
    async fn get_user_rate_limit(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
    ) -> StoreResult<Option<i64>>;

    async fn get_model_privilege(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        model: &str,
    ) -> StoreResult<Option<ModelPrivilege>>;

    async fn count_recent_model_messages(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        model: &str,
        window: Duration,
    ) -> StoreResult<i64>;

    /// Non-deleted messages in the session, grouped by role
    async fn count_session_messages(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
    ) -> StoreResult<RoleCounts>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub user: i64,
    pub assistant: i64,
}
