//! The chat pipeline: gate, author, assemble, stream, persist, enrich
//!
//! [`ChatPipeline::run`] is transport-agnostic. It writes through a
//! [`ReplySink`], which the HTTP layer implements with the SSE emitter and
//! non-streaming callers satisfy with [`DiscardSink`].

pub mod artifacts;
pub mod assembler;
pub mod enrich;
pub mod gate;

use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::llm::{
    base_url_for, tokens, AdapterDeps, AdapterRegistry, AdapterRequest, DeltaSink, DiscardSink,
    HttpClients, LlmAnswer, RecordingSink, RequestContext, Role, SecretSource, TokenBucket,
};
use crate::storage::{ChatStore, NewMessage, NewPrompt, Session, StoreError};
use assembler::{Assembler, HistoryWindow};
use async_trait::async_trait;
use enrich::{first_n_words, Enricher};
use gate::RateGate;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Client request body for `/api/chat_stream`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: String,
    pub session_uuid: String,
    /// Client id for the new user message, or the anchor when regenerating
    #[serde(default)]
    pub chat_uuid: String,
    #[serde(default)]
    pub regenerate: bool,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

/// Result of one pipeline run
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub answer: LlmAnswer,
    pub model: String,
    pub prompt_tokens: i64,
}

/// Client-facing side of a pipeline run
///
/// Extends [`DeltaSink`] with the events only the orchestrator emits. The
/// defaults describe a sink with no live client.
#[async_trait]
pub trait ReplySink: DeltaSink {
    fn set_model(&mut self, _model: &str) {}

    /// Commit response headers before the upstream call
    fn open(&mut self) {}

    /// Whether response headers have been committed
    fn is_open(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn send_error(&mut self, _err: &ApiError) {}

    async fn send_suggestions(&mut self, _answer_id: &str, _questions: &[String]) {}
}

#[async_trait]
impl ReplySink for DiscardSink {}

/// Everything the orchestrator decided before calling the provider
struct Prepared {
    session: Session,
    request: AdapterRequest,
    anchor_uuid: String,
    prompt_tokens: i64,
}

pub struct ChatPipeline {
    store: Arc<dyn ChatStore>,
    registry: Arc<AdapterRegistry>,
    enricher: Arc<Enricher>,
    config: Arc<Config>,
    shutdown: CancellationToken,
}

impl ChatPipeline {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn ChatStore>,
        registry: Arc<AdapterRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        let enricher = Arc::new(Enricher::new(
            store.clone(),
            registry.clone(),
            config.enrich.clone(),
            shutdown.clone(),
        ));
        Self {
            store,
            registry,
            enricher,
            config,
            shutdown,
        }
    }

    /// Build the adapter registry from configuration and wire the pipeline
    pub fn from_config(
        config: Arc<Config>,
        store: Arc<dyn ChatStore>,
        secrets: Arc<dyn SecretSource>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let deps = AdapterDeps {
            clients: HttpClients::new(&config.upstream)?,
            secrets,
            limiter: Arc::new(TokenBucket::new(
                config.limits.openai_rps,
                config.limits.openai_burst,
            )),
            upstream: config.upstream.clone(),
        };
        let registry = Arc::new(AdapterRegistry::new(deps));
        Ok(Self::new(config, store, registry, shutdown))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Answer one chat request, writing deltas to `sink`
    ///
    /// Errors raised after the sink opened are also written to it as a
    /// terminal event.
    pub async fn run<S: ReplySink>(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        request: ChatRequest,
        sink: &mut S,
    ) -> Result<ChatOutcome, ApiError> {
        let result = self.execute(ctx, user_id, &request, sink).await;
        if let Err(err) = &result {
            tracing::warn!(
                session = %request.session_uuid,
                code = err.code.as_str(),
                error = %err,
                "Chat request failed"
            );
            if sink.is_open() && sink.is_connected() {
                sink.send_error(err).await;
            }
        }
        result
    }

    async fn execute<S: ReplySink>(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        request: &ChatRequest,
        sink: &mut S,
    ) -> Result<ChatOutcome, ApiError> {
        let prepared = self.prepare(ctx, user_id, request).await?;
        sink.set_model(&prepared.session.model);

        let adapter = self
            .registry
            .select(&prepared.request.model, &prepared.request.messages);
        if prepared.request.messages.is_empty()
            || (adapter.needs_user_turn() && assembler::is_system_only(&prepared.request.messages))
        {
            return Err(ApiError::new(ErrorCode::SystemOnly));
        }

        tracing::debug!(
            session = %prepared.session.uuid,
            model = %prepared.session.model,
            adapter = adapter.name(),
            messages = prepared.request.messages.len(),
            "Calling upstream"
        );
        sink.open();

        let (result, recorded) = {
            let mut recorder = RecordingSink::new(&mut *sink);
            let result = adapter.stream(ctx, &mut recorder, &prepared.request).await;
            (result, recorder.recorded())
        };

        let answer = match result {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(
                    session = %prepared.session.uuid,
                    adapter = adapter.name(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "Upstream call failed"
                );
                let err = ApiError::from(e);
                if let Some(partial) = recorded.filter(|a| !a.is_empty()) {
                    tracing::info!(
                        session = %prepared.session.uuid,
                        answer_id = %partial.answer_id,
                        "Saving partial answer after upstream failure"
                    );
                    if let Err(save_err) = self.persist(&prepared, user_id, &partial).await {
                        tracing::warn!(error = %save_err, "Failed to save partial answer");
                    }
                }
                return Err(err);
            }
        };

        if answer.is_empty() && ctx.cancel.is_cancelled() {
            tracing::info!(session = %prepared.session.uuid, "Request cancelled before any answer");
            return Err(ApiError::new(ErrorCode::Cancelled));
        }

        self.persist(&prepared, user_id, &answer).await?;
        tracing::info!(
            session = %prepared.session.uuid,
            model = %prepared.session.model,
            answer_id = %answer.answer_id,
            cancelled = ctx.cancel.is_cancelled(),
            "Answer stored"
        );

        self.enrich(ctx, request, &prepared, &answer, sink).await;

        Ok(ChatOutcome {
            answer,
            model: prepared.session.model.clone(),
            prompt_tokens: prepared.prompt_tokens,
        })
    }

    /// Gates, validation, authoring and assembly
    async fn prepare(
        &self,
        ctx: &RequestContext,
        user_id: i64,
        request: &ChatRequest,
    ) -> Result<Prepared, ApiError> {
        let cancel = &ctx.cancel;
        let gate = RateGate::new(self.store.as_ref(), &self.config.limits);
        gate.check_user(cancel, user_id).await?;

        if request.session_uuid.trim().is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidInput).with_detail("sessionUuid is required"));
        }

        let mut session = match self.store.lookup_session(cancel, &request.session_uuid).await {
            Ok(session) if session.user_id == user_id => session,
            Ok(_) | Err(StoreError::NotFound(_)) => {
                return Err(ApiError::new(ErrorCode::NotFound).with_detail("chat session"))
            }
            Err(e) => return Err(e.into()),
        };

        let model = match self.store.lookup_model(cancel, &session.model).await {
            Ok(model) => model,
            Err(StoreError::NotFound(_)) => {
                return Err(ApiError::new(ErrorCode::ModelNotFound).with_detail(session.model.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        gate.check_model(cancel, user_id, &model).await?;

        let question = request.prompt.trim();
        let regenerating = request.regenerate || question.is_empty();
        let mut anchor_uuid = if regenerating {
            request.chat_uuid.clone()
        } else {
            String::new()
        };

        let prompts = self.store.list_session_prompts(cancel, &session.uuid).await?;
        if question.is_empty() && anchor_uuid.is_empty() && !prompts.is_empty() {
            anchor_uuid = self.latest_answer_uuid(cancel, &session.uuid).await?;
        }
        if prompts.is_empty() && !question.is_empty() {
            self.store
                .insert_prompt(
                    cancel,
                    NewPrompt {
                        session_uuid: session.uuid.clone(),
                        user_id,
                        role: Role::System,
                        content: request.prompt.clone(),
                        token_count: tokens::count_tokens(&request.prompt),
                    },
                )
                .await?;
            let topic = first_n_words(question, 10);
            self.store
                .update_session_topic(cancel, &session.uuid, &topic)
                .await?;
            session.topic = topic;
        } else if !question.is_empty() && anchor_uuid.is_empty() {
            let uuid = if request.chat_uuid.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                request.chat_uuid.clone()
            };
            self.store
                .insert_message(
                    cancel,
                    NewMessage {
                        uuid,
                        session_uuid: session.uuid.clone(),
                        user_id,
                        role: Role::User,
                        content: request.prompt.clone(),
                        reasoning_content: String::new(),
                        token_count: tokens::count_tokens(&request.prompt),
                        model: session.model.clone(),
                    },
                )
                .await?;
        }

        let window = HistoryWindow {
            anchor_uuid: anchor_uuid.clone(),
            regenerate: !anchor_uuid.is_empty(),
        };
        let messages = Assembler::new(self.store.as_ref(), &self.config.assembler)
            .assemble(cancel, &session, &window)
            .await?;

        let prompt_tokens = assembler::total_tokens(&messages);
        // Capped by the model catalog's max_token; 0 means no cap
        if model.max_token > 0 && prompt_tokens > model.max_token {
            return Err(ApiError::new(ErrorCode::TooManyTokens).with_detail(format!(
                "{prompt_tokens} tokens exceeds the {} token limit of {}",
                model.max_token, model.name
            )));
        }

        let files = self.store.list_session_files(cancel, &session.uuid).await?;
        let request = AdapterRequest {
            session: session.clone(),
            base_url: base_url_for(&model.url),
            model,
            messages,
            files,
            anchor_uuid: anchor_uuid.clone(),
            regenerate: !anchor_uuid.is_empty(),
            stream: request.stream,
        };

        Ok(Prepared {
            session,
            request,
            anchor_uuid,
            prompt_tokens,
        })
    }

    /// The newest message when it is an assistant turn, else empty
    async fn latest_answer_uuid(
        &self,
        cancel: &CancellationToken,
        session_uuid: &str,
    ) -> Result<String, ApiError> {
        let latest = self
            .store
            .list_latest_messages(cancel, session_uuid, 1)
            .await?;
        Ok(latest
            .into_iter()
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.uuid)
            .unwrap_or_default())
    }

    /// Store the answer and its artifacts
    ///
    /// Runs under the shutdown token rather than the request token so a
    /// disconnected client still gets its partial answer saved.
    async fn persist(
        &self,
        prepared: &Prepared,
        user_id: i64,
        answer: &LlmAnswer,
    ) -> Result<(), ApiError> {
        let cancel = self.shutdown.child_token();
        let content = answer.stored_content();
        let token_count = tokens::count_tokens(&content);

        let message_uuid = if prepared.anchor_uuid.is_empty() {
            self.store
                .insert_message(
                    &cancel,
                    NewMessage {
                        uuid: answer.answer_id.clone(),
                        session_uuid: prepared.session.uuid.clone(),
                        user_id,
                        role: Role::Assistant,
                        content,
                        reasoning_content: answer.reasoning.clone(),
                        token_count,
                        model: prepared.session.model.clone(),
                    },
                )
                .await?
                .uuid
        } else {
            self.store
                .update_message_content(
                    &cancel,
                    &prepared.anchor_uuid,
                    &content,
                    &answer.reasoning,
                    token_count,
                )
                .await?;
            prepared.anchor_uuid.clone()
        };

        let found = artifacts::extract_artifacts(&answer.answer);
        if !found.is_empty() || !prepared.anchor_uuid.is_empty() {
            let json = serde_json::to_value(&found)
                .map_err(|e| ApiError::new(ErrorCode::Internal).with_debug_info(e.to_string()))?;
            self.store
                .update_message_artifacts(&cancel, &message_uuid, &json)
                .await?;
        }
        Ok(())
    }

    /// Kick off background work and, in explore mode, relay suggestions
    async fn enrich<S: ReplySink>(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
        prepared: &Prepared,
        answer: &LlmAnswer,
        sink: &mut S,
    ) {
        if !request.prompt.trim().is_empty() {
            self.enricher
                .spawn_title(prepared.session.clone(), request.prompt.clone());
        }

        if !prepared.session.explore_mode || answer.answer.is_empty() {
            return;
        }
        let answer_id = if prepared.anchor_uuid.is_empty() {
            answer.answer_id.clone()
        } else {
            prepared.anchor_uuid.clone()
        };
        let receiver = self.enricher.spawn_suggestions(
            prepared.session.clone(),
            prepared.request.messages.clone(),
            answer_id.clone(),
            answer.answer.clone(),
        );

        if !request.stream || !sink.is_connected() {
            return;
        }
        let wait = Duration::from_secs(self.config.enrich.suggestions_wait_secs);
        let questions = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            result = tokio::time::timeout(wait, receiver) => match result {
                Ok(Ok(questions)) => questions,
                Ok(Err(_)) => return,
                Err(_) => {
                    tracing::debug!(answer_id = %answer_id, "Suggestions not ready, closing stream");
                    return;
                }
            },
        };
        if sink.is_connected() {
            sink.send_suggestions(&answer_id, &questions).await;
        }
    }
}
