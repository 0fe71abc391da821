//! HTTP server for the chat streaming API

use super::sse::SseEmitter;
use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::llm::{ChatCompletionResponse, DiscardSink, RequestContext};
use crate::pipeline::{ChatPipeline, ChatRequest};
use anyhow::Result;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, State},
    http::{header, request::Parts, Version},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

/// Shared application state
pub struct AppState {
    pub pipeline: Arc<ChatPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<ChatPipeline>) -> Arc<Self> {
        Arc::new(Self { pipeline })
    }

    fn config(&self) -> &Config {
        self.pipeline.config()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Caller identity resolved from the bearer token
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: i64,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized))?;

        state
            .config()
            .auth
            .tokens
            .get(token)
            .map(|&id| AuthUser { id })
            .ok_or_else(|| ApiError::new(ErrorCode::InvalidToken))
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/chat_stream", post(handle_chat))
        .route("/api/chat", post(handle_chat))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn run_http_server(pipeline: Arc<ChatPipeline>, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        pipeline.config().server.host,
        pipeline.config().server.port
    )
    .parse()?;
    let app = router(AppState::new(pipeline));

    tracing::info!("HTTP server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_chat(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    version: Version,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return ApiError::new(ErrorCode::InvalidInput)
                .with_detail(rejection.body_text())
                .into_response()
        }
    };

    tracing::debug!(
        user = user.id,
        session = %request.session_uuid,
        stream = request.stream,
        regenerate = request.regenerate,
        "Chat request"
    );

    if !request.stream {
        return answer_json(&state, user, request).await;
    }
    if version < Version::HTTP_11 {
        return ApiError::new(ErrorCode::StreamUnsupported)
            .with_debug_info(format!("{version:?} cannot carry a chunked event stream"))
            .into_response();
    }
    answer_stream(&state, user, request).await
}

async fn answer_json(state: &AppState, user: AuthUser, request: ChatRequest) -> Response {
    let ctx = RequestContext::new(state.pipeline.shutdown_token().child_token());
    match state
        .pipeline
        .run(&ctx, user.id, request, &mut DiscardSink)
        .await
    {
        Ok(outcome) => Json(ChatCompletionResponse::from_answer(
            &outcome.answer,
            &outcome.model,
            outcome.prompt_tokens,
        ))
        .into_response(),
        Err(err) => err.into_response(),
    }
}

/// Run the pipeline on its own task and hand back the event stream
///
/// Failures before the first event still get a JSON error response with the
/// proper status. Once an event was written the stream is the response.
async fn answer_stream(state: &AppState, user: AuthUser, request: ChatRequest) -> Response {
    let cancel = state.pipeline.shutdown_token().child_token();
    let (mut emitter, gate, body) =
        SseEmitter::channel(cancel.clone(), state.config().server.keepalive_secs);

    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(async move {
        let ctx = RequestContext::new(cancel);
        pipeline
            .run(&ctx, user.id, request, &mut emitter)
            .await
            .map(|_| ())
    });

    if gate.await.is_ok() {
        return body.into_response();
    }
    match task.await {
        Ok(Ok(())) => body.into_response(),
        Ok(Err(err)) => err.into_response(),
        Err(e) => ApiError::new(ErrorCode::Internal)
            .with_debug_info(format!("chat task failed: {e}"))
            .into_response(),
    }
}
