//! Server-sent events writer for chat streams
//!
//! The emitter owns the sending half of a bounded channel whose receiver
//! backs the response body, so a slow client applies back-pressure all the
//! way to the upstream read. Headers are committed through a oneshot gate,
//! either explicitly or by the first write; until then the handler may still
//! answer with JSON.

use crate::error::ApiError;
use crate::llm::{ChatCompletionChunk, ChunkChoice, ChunkDelta, Delta, DeltaSink, SinkClosed};
use crate::pipeline::ReplySink;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

const CHANNEL_CAPACITY: usize = 32;
const KEEPALIVE_FRAME: &str = ": keep-alive\n\n";

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("client disconnected")]
    Disconnected,

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Resolves once the emitter commits headers; errors if it never does
pub type HeaderGate = oneshot::Receiver<()>;

/// Writer half of one SSE response
pub struct SseEmitter {
    tx: mpsc::Sender<String>,
    gate: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
    model: String,
    last_id: String,
    connected: bool,
}

/// Reader half, turned into the response body
pub struct SseBody {
    rx: mpsc::Receiver<String>,
    keepalive: Option<Duration>,
    _cancel_on_drop: DropGuard,
}

impl SseEmitter {
    /// Create an emitter bound to `cancel`
    ///
    /// The token is cancelled when the body is dropped (client gone) or a
    /// write finds the receiver closed.
    pub fn channel(cancel: CancellationToken, keepalive_secs: u64) -> (Self, HeaderGate, SseBody) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (gate_tx, gate_rx) = oneshot::channel();
        let body = SseBody {
            rx,
            keepalive: (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs)),
            _cancel_on_drop: cancel.clone().drop_guard(),
        };
        let emitter = Self {
            tx,
            gate: Some(gate_tx),
            cancel,
            model: String::new(),
            last_id: String::new(),
            connected: true,
        };
        (emitter, gate_rx, body)
    }

    async fn write_frame(&mut self, frame: String) -> Result<(), EmitError> {
        if !self.connected {
            return Err(EmitError::Disconnected);
        }
        ReplySink::open(self);
        if self.tx.send(frame).await.is_err() {
            self.connected = false;
            self.cancel.cancel();
            return Err(EmitError::Disconnected);
        }
        Ok(())
    }

    /// Write one `data:` event
    pub async fn write_event<T: Serialize>(&mut self, event: &T) -> Result<(), EmitError> {
        let json = serde_json::to_string(event)?;
        self.write_frame(format!("data: {json}\n\n")).await
    }

    fn envelope(&self, id: &str, delta: ChunkDelta, finish_reason: Option<&str>) -> ChatCompletionChunk {
        ChatCompletionChunk::new(
            id,
            &self.model,
            ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            },
        )
    }
}

#[async_trait]
impl DeltaSink for SseEmitter {
    async fn send(&mut self, delta: Delta) -> Result<(), SinkClosed> {
        self.last_id.clone_from(&delta.answer_id);
        let chunk = ChatCompletionChunk::from_delta(&delta, &self.model);
        self.write_event(&chunk).await.map_err(|e| {
            tracing::debug!("Dropping delta: {}", e);
            SinkClosed
        })
    }
}

#[async_trait]
impl ReplySink for SseEmitter {
    fn set_model(&mut self, model: &str) {
        self.model = model.to_string();
    }

    fn open(&mut self) {
        if let Some(gate) = self.gate.take() {
            let _ = gate.send(());
        }
    }

    fn is_open(&self) -> bool {
        self.gate.is_none()
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.tx.is_closed()
    }

    async fn send_error(&mut self, err: &ApiError) {
        let delta = ChunkDelta {
            content: err.stream_text(),
            ..ChunkDelta::default()
        };
        let chunk = self.envelope(&self.last_id, delta, Some("error"));
        if let Err(e) = self.write_event(&chunk).await {
            tracing::debug!("Could not deliver error event: {}", e);
        }
    }

    async fn send_suggestions(&mut self, answer_id: &str, questions: &[String]) {
        let delta = ChunkDelta {
            suggested_questions: Some(questions.to_vec()),
            ..ChunkDelta::default()
        };
        let chunk = self.envelope(answer_id, delta, None);
        if let Err(e) = self.write_event(&chunk).await {
            tracing::debug!("Could not deliver suggestions: {}", e);
        }
    }
}

impl SseBody {
    fn into_stream(self) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
        futures::stream::unfold(self, |mut body| async move {
            let frame = match body.keepalive {
                Some(period) => match tokio::time::timeout(period, body.rx.recv()).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return None,
                    Err(_) => KEEPALIVE_FRAME.to_string(),
                },
                None => body.rx.recv().await?,
            };
            Some((Ok(frame), body))
        })
    }
}

impl IntoResponse for SseBody {
    fn into_response(self) -> Response {
        let mut response = Body::from_stream(self.into_stream()).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::llm::AnswerId;
    use futures::StreamExt;

    fn delta(text: &str) -> Delta {
        Delta {
            answer_id: "a1".into(),
            index: 0,
            content: text.into(),
            reasoning: None,
        }
    }

    #[tokio::test]
    async fn test_first_write_opens_gate() {
        let (mut emitter, gate, body) = SseEmitter::channel(CancellationToken::new(), 0);
        emitter.set_model("gpt-4o");
        assert!(!emitter.is_open());
        emitter.send(delta("Hi")).await.unwrap();
        assert!(emitter.is_open());
        gate.await.unwrap();
        drop(emitter);

        let frames: Vec<String> = body.into_stream().map(|f| f.unwrap()).collect().await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("data: {"));
        assert!(frames[0].ends_with("\n\n"));
        let json: serde_json::Value =
            serde_json::from_str(frames[0].trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(json["id"], "a1");
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["choices"][0]["delta"]["content"], "Hi");
    }

    #[tokio::test]
    async fn test_gate_fails_when_never_opened() {
        let (emitter, gate, _body) = SseEmitter::channel(CancellationToken::new(), 0);
        drop(emitter);
        assert!(gate.await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_body_cancels_and_fails_writes() {
        let cancel = CancellationToken::new();
        let (mut emitter, _gate, body) = SseEmitter::channel(cancel.clone(), 0);
        drop(body);
        assert!(cancel.is_cancelled());
        assert!(!emitter.is_connected());
        assert!(emitter.send(delta("Hi")).await.is_err());
    }

    #[tokio::test]
    async fn test_error_and_suggestion_events() {
        let (mut emitter, _gate, body) = SseEmitter::channel(CancellationToken::new(), 0);
        let id = AnswerId::for_request(&crate::llm::fixtures::request(
            crate::llm::fixtures::model("m", "openai", "http://x"),
            Vec::new(),
        ));
        emitter.send(Delta::content(&id, 0, "Hi")).await.unwrap();
        emitter
            .send_error(&ApiError::new(ErrorCode::UpstreamReported).with_detail("overloaded"))
            .await;
        emitter
            .send_suggestions(id.as_str(), &["Why?".to_string()])
            .await;
        drop(emitter);

        let frames: Vec<serde_json::Value> = body
            .into_stream()
            .map(|f| serde_json::from_str(f.unwrap().trim_start_matches("data: ").trim()).unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1]["choices"][0]["finish_reason"], "error");
        assert!(frames[1]["choices"][0]["delta"]["content"]
            .as_str()
            .unwrap()
            .starts_with("[ERROR] MODEL_005"));
        assert_eq!(frames[1]["id"], id.as_str());
        assert_eq!(frames[2]["choices"][0]["delta"]["suggestedQuestions"][0], "Why?");
        assert_eq!(frames[2]["choices"][0]["delta"]["content"], "");
    }

    #[tokio::test]
    async fn test_keepalive_comment_while_idle() {
        let (emitter, _gate, body) = SseEmitter::channel(CancellationToken::new(), 1);
        let mut stream = Box::pin(body.into_stream());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, KEEPALIVE_FRAME);
        drop(emitter);
        assert!(stream.next().await.is_none());
    }
}
