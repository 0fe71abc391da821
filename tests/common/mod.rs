//! Shared harness: a mock provider and a chatpipe server on loopback

#![allow(dead_code)]

use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Router;
use chatpipe::config::Config;
use chatpipe::llm::{ChatMessage, Role, StaticSecrets};
use chatpipe::storage::{ChatModel, ChatStore, NewMessage, NewPrompt, Session, SqliteStore, StoredMessage};
use chatpipe::transport::{router, AppState};
use chatpipe::ChatPipeline;
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const TOKEN: &str = "tok-1";
pub const USER: i64 = 1;

pub type Seen = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

/// Body pieces a mock provider sends back, each after its delay
pub type Script = (&'static str, Vec<(Duration, String)>);

type Responder = Arc<dyn Fn(&Value) -> Script + Send + Sync>;

/// A provider that replays a scripted body, one piece at a time
pub struct MockUpstream {
    pub base: String,
    pub seen: Seen,
}

impl MockUpstream {
    /// Serve `pieces` in order, sleeping before each as scripted
    pub async fn scripted(content_type: &'static str, pieces: Vec<(Duration, String)>) -> Self {
        Self::respond(move |_| (content_type, pieces.clone())).await
    }

    /// Pick the script per request from its JSON body
    pub async fn respond(responder: impl Fn(&Value) -> Script + Send + Sync + 'static) -> Self {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let responder: Responder = Arc::new(responder);

        let app = Router::new().fallback(move |headers: HeaderMap, payload: String| {
            let seen = recorded.clone();
            let responder = responder.clone();
            async move {
                let json: Value = serde_json::from_str(&payload).unwrap_or_default();
                let (content_type, pieces) = responder(&json);
                seen.lock().unwrap().push((headers, json));
                let body = futures::stream::iter(pieces).then(|(delay, text)| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, Infallible>(text)
                });
                Response::builder()
                    .header("content-type", content_type)
                    .body(Body::from_stream(body))
                    .unwrap()
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            seen,
        }
    }

    /// Serve one complete body immediately
    pub async fn fixed(content_type: &'static str, body: impl Into<String>) -> Self {
        Self::scripted(content_type, vec![(Duration::ZERO, body.into())]).await
    }

    pub fn requests(&self) -> Vec<(HeaderMap, Value)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn last_body(&self) -> Value {
        self.requests()
            .last()
            .map(|(_, body)| body.clone())
            .unwrap_or_default()
    }
}

/// OpenAI-style SSE stream carrying `deltas`, then `[DONE]`
pub fn openai_sse(deltas: &[&str]) -> String {
    let mut body = String::new();
    for delta in deltas {
        let chunk = serde_json::json!({
            "id": "chatcmpl-abc123",
            "object": "chat.completion.chunk",
            "choices": [{ "index": 0, "delta": { "content": delta } }],
        });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Non-streaming OpenAI completion body
pub fn openai_json(content: &str) -> String {
    serde_json::json!({
        "id": "chatcmpl-side",
        "object": "chat.completion",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }],
    })
    .to_string()
}

pub fn openai_frame(delta: &str) -> String {
    let chunk = serde_json::json!({
        "id": "chatcmpl-abc123",
        "choices": [{ "index": 0, "delta": { "content": delta } }],
    });
    format!("data: {chunk}\n\n")
}

pub fn model(name: &str, api_type: &str, url: String, key_env: &str, header: &str) -> ChatModel {
    ChatModel {
        name: name.into(),
        url,
        api_auth_header: header.into(),
        api_auth_key: key_env.into(),
        api_type: api_type.into(),
        default_token: 1024,
        max_token: 100_000,
        enable_per_mode_ratelimit: false,
        http_timeout_secs: 0,
    }
}

pub struct TestApp {
    pub base: String,
    pub store: Arc<SqliteStore>,
    pub client: reqwest::Client,
    pub shutdown: CancellationToken,
    _dir: TempDir,
}

impl TestApp {
    pub async fn spawn(models: Vec<ChatModel>) -> Self {
        Self::spawn_with(models, |_| {}).await
    }

    pub async fn spawn_with(models: Vec<ChatModel>, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("chat.db")).unwrap());
        for model in &models {
            store.upsert_model(model).unwrap();
        }

        let mut config = Config::default();
        config.auth.tokens.insert(TOKEN.into(), USER);
        config.server.keepalive_secs = 1;
        config.assembler.artifact_instructions = false;
        config.enrich.suggestions_wait_secs = 2;
        tweak(&mut config);

        let secrets = StaticSecrets::default()
            .with("OPENAI_API_KEY", "sk-openai")
            .with("CLAUDE_API_KEY", "sk-claude")
            .with("GEMINI_API_KEY", "gm-key");

        let shutdown = CancellationToken::new();
        let pipeline = ChatPipeline::from_config(
            Arc::new(config),
            store.clone(),
            Arc::new(secrets),
            shutdown.clone(),
        )
        .unwrap();
        let app = router(AppState::new(Arc::new(pipeline)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            store,
            client: reqwest::Client::new(),
            shutdown,
            _dir: dir,
        }
    }

    pub fn session(&self, uuid: &str, model: &str) -> Session {
        let session = Session::new(uuid, USER, model);
        self.store.create_session(&session).unwrap();
        session
    }

    pub fn session_with(&self, uuid: &str, model: &str, tweak: impl FnOnce(&mut Session)) -> Session {
        let mut session = Session::new(uuid, USER, model);
        tweak(&mut session);
        self.store.create_session(&session).unwrap();
        session
    }

    pub async fn topic(&self, session: &str) -> String {
        self.store
            .lookup_session(&CancellationToken::new(), session)
            .await
            .unwrap()
            .topic
    }

    pub fn stored(&self, session: &str) -> Vec<StoredMessage> {
        self.store.dump_session(session).unwrap().1
    }

    pub async fn add_prompt(&self, session: &str, content: &str) {
        self.store
            .insert_prompt(
                &CancellationToken::new(),
                NewPrompt {
                    session_uuid: session.into(),
                    user_id: USER,
                    role: Role::System,
                    content: content.into(),
                    token_count: 5,
                },
            )
            .await
            .unwrap();
    }

    pub async fn add_message(&self, session: &str, uuid: &str, role: Role, content: &str) {
        self.store
            .insert_message(
                &CancellationToken::new(),
                NewMessage {
                    uuid: uuid.into(),
                    session_uuid: session.into(),
                    user_id: USER,
                    role,
                    content: content.into(),
                    reasoning_content: String::new(),
                    token_count: 5,
                    model: String::new(),
                },
            )
            .await
            .unwrap();
    }

    pub async fn post(&self, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/api/chat_stream", self.base))
            .bearer_auth(TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Stored (role, content) pairs for a session, oldest first
    pub fn messages(&self, session: &str) -> Vec<(Role, String, String)> {
        let (_, messages) = self.store.dump_session(session).unwrap();
        messages
            .into_iter()
            .map(|m| (m.role, m.content, m.uuid))
            .collect()
    }

    pub fn prompts(&self, session: &str) -> Vec<ChatMessage> {
        let (prompts, _) = self.store.dump_session(session).unwrap();
        prompts
            .into_iter()
            .map(|p| ChatMessage::new(p.role, p.content))
            .collect()
    }

    /// Poll until `check` holds or a few seconds pass
    pub async fn eventually(&self, mut check: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..50 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        check(self)
    }
}

/// JSON payloads of every `data:` event in an SSE body
pub fn data_events(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(|json| serde_json::from_str(json).unwrap())
        .collect()
}

pub fn delta_content(event: &Value) -> &str {
    event["choices"][0]["delta"]["content"].as_str().unwrap_or("")
}
