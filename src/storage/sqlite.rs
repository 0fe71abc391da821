//! SQLite implementation of the persistence port
//!
//! One connection behind a mutex; blocking rusqlite calls run on the
//! blocking pool and race the caller's cancellation token. Every write is a
//! single statement, so a cancelled call never leaves half a row behind.

use super::{
    ChatFile, ChatModel, ChatStore, ModelPrivilege, NewMessage, NewPrompt, Prompt, RoleCounts,
    Session, StoreError, StoreResult, StoredMessage,
};
use crate::llm::Role;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS chat_sessions (
        uuid TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        model TEXT NOT NULL,
        max_length INTEGER NOT NULL DEFAULT 0,
        temperature REAL NOT NULL DEFAULT 1.0,
        top_p REAL NOT NULL DEFAULT 1.0,
        max_tokens INTEGER NOT NULL DEFAULT 4096,
        n INTEGER NOT NULL DEFAULT 1,
        debug BOOLEAN NOT NULL DEFAULT 0,
        summarize_mode BOOLEAN NOT NULL DEFAULT 0,
        explore_mode BOOLEAN NOT NULL DEFAULT 0,
        topic TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chat_prompts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        session_uuid TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        token_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chat_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        session_uuid TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        reasoning_content TEXT NOT NULL DEFAULT '',
        token_count INTEGER NOT NULL DEFAULT 0,
        is_pin BOOLEAN NOT NULL DEFAULT 0,
        artifacts TEXT,
        suggested_questions TEXT,
        summary TEXT,
        model TEXT NOT NULL DEFAULT '',
        is_deleted BOOLEAN NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chat_models (
        name TEXT PRIMARY KEY,
        url TEXT NOT NULL,
        api_auth_header TEXT NOT NULL DEFAULT '',
        api_auth_key TEXT NOT NULL DEFAULT '',
        api_type TEXT NOT NULL DEFAULT 'openai',
        default_token INTEGER NOT NULL DEFAULT 0,
        max_token INTEGER NOT NULL DEFAULT 0,
        enable_per_mode_ratelimit BOOLEAN NOT NULL DEFAULT 0,
        http_timeout_secs INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS chat_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_uuid TEXT NOT NULL,
        name TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        data BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS user_rate_limits (
        user_id INTEGER PRIMARY KEY,
        rate_limit INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS model_privileges (
        user_id INTEGER NOT NULL,
        model TEXT NOT NULL,
        rate_limit INTEGER NOT NULL,
        PRIMARY KEY (user_id, model)
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON chat_messages(session_uuid, id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_user_time ON chat_messages(user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_prompts_session ON chat_prompts(session_uuid, id)",
];

const MESSAGE_COLUMNS: &str = "uuid, session_uuid, user_id, role, content, reasoning_content, \
     token_count, is_pin, artifacts, suggested_questions, summary, model, created_at";

/// rusqlite-backed [`ChatStore`]
#[derive(Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        Self::init(conn, db_path)
    }

    /// Private in-memory database
    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, db_path: PathBuf) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        for stmt in SCHEMA {
            conn.execute(stmt, [])?;
        }
        Ok(Self {
            db_path,
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` on the blocking pool unless `cancel` fires before it starts
    ///
    /// Once the closure holds the connection it runs to completion and its
    /// own result is returned, so a cancelled caller never sees `Cancelled`
    /// for a write that committed.
    async fn call<T, F>(&self, cancel: &CancellationToken, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let db = Arc::clone(&self.db);
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| StoreError::Backend(anyhow!("database lock poisoned")))?;
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Backend(e.into()))?
    }

    /// Synchronous variant for seeding and tests
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self
            .db
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("database lock poisoned")))?;
        f(&conn)
    }

    // --- seeding helpers (not part of the port) ---

    pub fn create_session(&self, session: &Session) -> StoreResult<()> {
        let s = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO chat_sessions
                 (uuid, user_id, model, max_length, temperature, top_p, max_tokens, n,
                  debug, summarize_mode, explore_mode, topic, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    s.uuid,
                    s.user_id,
                    s.model,
                    s.max_length,
                    s.temperature,
                    s.top_p,
                    s.max_tokens,
                    s.n,
                    s.debug,
                    s.summarize_mode,
                    s.explore_mode,
                    s.topic,
                    s.created_at.timestamp_millis(),
                    s.updated_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn upsert_model(&self, model: &ChatModel) -> StoreResult<()> {
        let m = model.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO chat_models
                 (name, url, api_auth_header, api_auth_key, api_type, default_token, max_token,
                  enable_per_mode_ratelimit, http_timeout_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    m.name,
                    m.url,
                    m.api_auth_header,
                    m.api_auth_key,
                    m.api_type,
                    m.default_token,
                    m.max_token,
                    m.enable_per_mode_ratelimit,
                    m.http_timeout_secs as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn add_file(&self, session_uuid: &str, file: &ChatFile) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_files (session_uuid, name, mime_type, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_uuid, file.name, file.mime_type, file.data],
            )?;
            Ok(())
        })
    }

    pub fn set_user_rate_limit(&self, user_id: i64, rate_limit: i64) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO user_rate_limits (user_id, rate_limit) VALUES (?1, ?2)",
                params![user_id, rate_limit],
            )?;
            Ok(())
        })
    }

    pub fn grant_model_privilege(&self, privilege: &ModelPrivilege) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO model_privileges (user_id, model, rate_limit)
                 VALUES (?1, ?2, ?3)",
                params![privilege.user_id, privilege.model, privilege.rate_limit],
            )?;
            Ok(())
        })
    }

    /// Store an out-of-band summary for a message
    pub fn set_message_summary(&self, uuid: &str, summary: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE chat_messages SET summary = ?2 WHERE uuid = ?1",
                params![uuid, summary],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound("message"));
            }
            Ok(())
        })
    }

    pub fn soft_delete_message(&self, uuid: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chat_messages SET is_deleted = 1 WHERE uuid = ?1",
                params![uuid],
            )?;
            Ok(())
        })
    }

    /// All prompts and messages of a session, for inspection
    pub fn dump_session(&self, session_uuid: &str) -> StoreResult<(Vec<Prompt>, Vec<StoredMessage>)> {
        let session_uuid = session_uuid.to_string();
        self.with_conn(move |conn| {
            let prompts = query_prompts(conn, &session_uuid)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE session_uuid = ?1 AND is_deleted = 0 ORDER BY id"
            ))?;
            let messages = stmt
                .query_map(params![session_uuid], message_from_row)?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect messages")?;
            Ok((prompts, messages))
        })
    }

    /// Load a seed file of models, sessions and limits
    pub fn apply_seed(&self, seed: &SeedFile) -> StoreResult<()> {
        for model in &seed.models {
            self.upsert_model(model)?;
        }
        for s in &seed.sessions {
            let mut session = Session::new(&s.uuid, s.user_id, &s.model);
            session.max_length = s.max_length;
            session.temperature = s.temperature;
            session.top_p = s.top_p;
            session.max_tokens = s.max_tokens;
            session.n = s.n;
            session.debug = s.debug;
            session.summarize_mode = s.summarize_mode;
            session.explore_mode = s.explore_mode;
            session.topic = s.topic.clone();
            self.create_session(&session)?;
        }
        for limit in &seed.rate_limits {
            self.set_user_rate_limit(limit.user_id, limit.rate_limit)?;
        }
        for privilege in &seed.privileges {
            self.grant_model_privilege(privilege)?;
        }
        Ok(())
    }
}

/// TOML seed document consumed by `chatpipe seed`
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SeedFile {
    pub models: Vec<ChatModel>,
    pub sessions: Vec<SeedSession>,
    pub rate_limits: Vec<SeedRateLimit>,
    pub privileges: Vec<ModelPrivilege>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedSession {
    pub uuid: String,
    pub user_id: i64,
    pub model: String,
    #[serde(default)]
    pub max_length: i64,
    #[serde(default = "one_f64")]
    pub temperature: f64,
    #[serde(default = "one_f64")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default = "one_i64")]
    pub n: i64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub summarize_mode: bool,
    #[serde(default)]
    pub explore_mode: bool,
    #[serde(default)]
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedRateLimit {
    pub user_id: i64,
    pub rate_limit: i64,
}

fn one_f64() -> f64 {
    1.0
}

fn one_i64() -> i64 {
    1
}

fn default_max_tokens() -> i64 {
    4096
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn role_from_sql(row: &Row<'_>, idx: usize) -> rusqlite::Result<Role> {
    let text: String = row.get(idx)?;
    text.parse::<Role>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let artifacts: Option<String> = row.get(8)?;
    let questions: Option<String> = row.get(9)?;
    Ok(StoredMessage {
        uuid: row.get(0)?,
        session_uuid: row.get(1)?,
        user_id: row.get(2)?,
        role: role_from_sql(row, 3)?,
        content: row.get(4)?,
        reasoning_content: row.get(5)?,
        token_count: row.get(6)?,
        is_pin: row.get(7)?,
        artifacts: artifacts.and_then(|a| serde_json::from_str(&a).ok()),
        suggested_questions: questions
            .and_then(|q| serde_json::from_str(&q).ok())
            .unwrap_or_default(),
        summary: row.get(10)?,
        model: row.get(11)?,
        created_at: millis_to_utc(row.get(12)?),
    })
}

fn query_prompts(conn: &Connection, session_uuid: &str) -> StoreResult<Vec<Prompt>> {
    let mut stmt = conn.prepare(
        "SELECT uuid, session_uuid, role, content, token_count
         FROM chat_prompts WHERE session_uuid = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![session_uuid], |row| {
        Ok(Prompt {
            uuid: row.get(0)?,
            session_uuid: row.get(1)?,
            role: role_from_sql(row, 2)?,
            content: row.get(3)?,
            token_count: row.get(4)?,
        })
    })?;
    Ok(rows
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect prompts")?)
}

fn window_start(window: Duration) -> i64 {
    Utc::now().timestamp_millis() - window.as_millis() as i64
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn lookup_session(&self, cancel: &CancellationToken, uuid: &str) -> StoreResult<Session> {
        let uuid = uuid.to_string();
        self.call(cancel, move |conn| {
            conn.query_row(
                "SELECT uuid, user_id, model, max_length, temperature, top_p, max_tokens, n,
                        debug, summarize_mode, explore_mode, topic, created_at, updated_at
                 FROM chat_sessions WHERE uuid = ?1",
                params![uuid],
                |row| {
                    Ok(Session {
                        uuid: row.get(0)?,
                        user_id: row.get(1)?,
                        model: row.get(2)?,
                        max_length: row.get(3)?,
                        temperature: row.get(4)?,
                        top_p: row.get(5)?,
                        max_tokens: row.get(6)?,
                        n: row.get(7)?,
                        debug: row.get(8)?,
                        summarize_mode: row.get(9)?,
                        explore_mode: row.get(10)?,
                        topic: row.get(11)?,
                        created_at: millis_to_utc(row.get(12)?),
                        updated_at: millis_to_utc(row.get(13)?),
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound("session"))
        })
        .await
    }

    async fn lookup_model(&self, cancel: &CancellationToken, name: &str) -> StoreResult<ChatModel> {
        let name = name.to_string();
        self.call(cancel, move |conn| {
            conn.query_row(
                "SELECT name, url, api_auth_header, api_auth_key, api_type, default_token,
                        max_token, enable_per_mode_ratelimit, http_timeout_secs
                 FROM chat_models WHERE name = ?1",
                params![name],
                |row| {
                    Ok(ChatModel {
                        name: row.get(0)?,
                        url: row.get(1)?,
                        api_auth_header: row.get(2)?,
                        api_auth_key: row.get(3)?,
                        api_type: row.get(4)?,
                        default_token: row.get(5)?,
                        max_token: row.get(6)?,
                        enable_per_mode_ratelimit: row.get(7)?,
                        http_timeout_secs: row.get::<_, i64>(8)?.max(0) as u64,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound("model"))
        })
        .await
    }

    async fn list_session_prompts(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
    ) -> StoreResult<Vec<Prompt>> {
        let session_uuid = session_uuid.to_string();
        self.call(cancel, move |conn| query_prompts(conn, &session_uuid))
            .await
    }

    async fn list_latest_messages(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let session_uuid = session_uuid.to_string();
        self.call(cancel, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE session_uuid = ?1 AND is_deleted = 0
                 ORDER BY id DESC LIMIT ?2"
            ))?;
            let mut messages = stmt
                .query_map(params![session_uuid, limit as i64], message_from_row)?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect messages")?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    async fn list_messages_before(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
        anchor_uuid: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let session_uuid = session_uuid.to_string();
        let anchor_uuid = anchor_uuid.to_string();
        self.call(cancel, move |conn| {
            let anchor_id: i64 = conn
                .query_row(
                    "SELECT id FROM chat_messages WHERE uuid = ?1 AND session_uuid = ?2",
                    params![anchor_uuid, session_uuid],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::NotFound("message"))?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE session_uuid = ?1 AND is_deleted = 0 AND id < ?2
                 ORDER BY id DESC LIMIT ?3"
            ))?;
            let mut messages = stmt
                .query_map(params![session_uuid, anchor_id, limit as i64], message_from_row)?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect messages")?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    async fn list_session_files(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
    ) -> StoreResult<Vec<ChatFile>> {
        let session_uuid = session_uuid.to_string();
        self.call(cancel, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, mime_type, data FROM chat_files WHERE session_uuid = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![session_uuid], |row| {
                Ok(ChatFile {
                    name: row.get(0)?,
                    mime_type: row.get(1)?,
                    data: row.get(2)?,
                })
            })?;
            Ok(rows
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect files")?)
        })
        .await
    }

    async fn insert_prompt(
        &self,
        cancel: &CancellationToken,
        prompt: NewPrompt,
    ) -> StoreResult<Prompt> {
        self.call(cancel, move |conn| {
            let uuid = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO chat_prompts
                 (uuid, session_uuid, user_id, role, content, token_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    uuid,
                    prompt.session_uuid,
                    prompt.user_id,
                    prompt.role.as_str(),
                    prompt.content,
                    prompt.token_count,
                    Utc::now().timestamp_millis(),
                ],
            )?;
            Ok(Prompt {
                uuid,
                session_uuid: prompt.session_uuid,
                role: prompt.role,
                content: prompt.content,
                token_count: prompt.token_count,
            })
        })
        .await
    }

    async fn insert_message(
        &self,
        cancel: &CancellationToken,
        message: NewMessage,
    ) -> StoreResult<StoredMessage> {
        self.call(cancel, move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO chat_messages
                 (uuid, session_uuid, user_id, role, content, reasoning_content, token_count,
                  model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    message.uuid,
                    message.session_uuid,
                    message.user_id,
                    message.role.as_str(),
                    message.content,
                    message.reasoning_content,
                    message.token_count,
                    message.model,
                    now.timestamp_millis(),
                ],
            )?;
            Ok(StoredMessage {
                uuid: message.uuid,
                session_uuid: message.session_uuid,
                user_id: message.user_id,
                role: message.role,
                content: message.content,
                reasoning_content: message.reasoning_content,
                token_count: message.token_count,
                is_pin: false,
                artifacts: None,
                suggested_questions: Vec::new(),
                summary: None,
                model: message.model,
                created_at: now,
            })
        })
        .await
    }

    async fn update_message_content(
        &self,
        cancel: &CancellationToken,
        uuid: &str,
        content: &str,
        reasoning_content: &str,
        token_count: i64,
    ) -> StoreResult<()> {
        let (uuid, content, reasoning) =
            (uuid.to_string(), content.to_string(), reasoning_content.to_string());
        self.call(cancel, move |conn| {
            let n = conn.execute(
                "UPDATE chat_messages
                 SET content = ?2, reasoning_content = ?3, token_count = ?4, updated_at = ?5
                 WHERE uuid = ?1",
                params![uuid, content, reasoning, token_count, Utc::now().timestamp_millis()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound("message"));
            }
            Ok(())
        })
        .await
    }

    async fn update_message_suggestions(
        &self,
        cancel: &CancellationToken,
        uuid: &str,
        questions: &[String],
    ) -> StoreResult<()> {
        let uuid = uuid.to_string();
        let json = serde_json::to_string(questions).map_err(|e| StoreError::Backend(e.into()))?;
        self.call(cancel, move |conn| {
            conn.execute(
                "UPDATE chat_messages SET suggested_questions = ?2 WHERE uuid = ?1",
                params![uuid, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_message_artifacts(
        &self,
        cancel: &CancellationToken,
        uuid: &str,
        artifacts: &serde_json::Value,
    ) -> StoreResult<()> {
        let uuid = uuid.to_string();
        let json = artifacts.to_string();
        self.call(cancel, move |conn| {
            conn.execute(
                "UPDATE chat_messages SET artifacts = ?2 WHERE uuid = ?1",
                params![uuid, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_session_topic(
        &self,
        cancel: &CancellationToken,
        uuid: &str,
        topic: &str,
    ) -> StoreResult<()> {
        let (uuid, topic) = (uuid.to_string(), topic.to_string());
        self.call(cancel, move |conn| {
            let n = conn.execute(
                "UPDATE chat_sessions SET topic = ?2, updated_at = ?3 WHERE uuid = ?1",
                params![uuid, topic, Utc::now().timestamp_millis()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound("session"));
            }
            Ok(())
        })
        .await
    }

    async fn count_recent_messages(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        window: Duration,
    ) -> StoreResult<i64> {
        let since = window_start(window);
        self.call(cancel, move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM chat_messages
                 WHERE user_id = ?1 AND is_deleted = 0 AND created_at > ?2",
                params![user_id, since],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn get_user_rate_limit(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
    ) -> StoreResult<Option<i64>> {
        self.call(cancel, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT rate_limit FROM user_rate_limits WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn get_model_privilege(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        model: &str,
    ) -> StoreResult<Option<ModelPrivilege>> {
        let model = model.to_string();
        self.call(cancel, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT user_id, model, rate_limit FROM model_privileges
                     WHERE user_id = ?1 AND model = ?2",
                    params![user_id, model],
                    |row| {
                        Ok(ModelPrivilege {
                            user_id: row.get(0)?,
                            model: row.get(1)?,
                            rate_limit: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn count_recent_model_messages(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        model: &str,
        window: Duration,
    ) -> StoreResult<i64> {
        let since = window_start(window);
        let model = model.to_string();
        self.call(cancel, move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM chat_messages
                 WHERE user_id = ?1 AND model = ?2 AND is_deleted = 0 AND created_at > ?3",
                params![user_id, model, since],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn count_session_messages(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
    ) -> StoreResult<RoleCounts> {
        let session_uuid = session_uuid.to_string();
        self.call(cancel, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT role, COUNT(*) FROM chat_messages
                 WHERE session_uuid = ?1 AND is_deleted = 0 GROUP BY role",
            )?;
            let rows = stmt.query_map(params![session_uuid], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = RoleCounts::default();
            for row in rows {
                let (role, n) = row?;
                match role.as_str() {
                    "user" => counts.user = n,
                    "assistant" => counts.assistant = n,
                    _ => {}
                }
            }
            Ok(counts)
        })
        .await
    }
}
