//! Background enrichment: session titles and suggested follow-up questions
//!
//! Both tasks run detached from the request. They only observe the process
//! shutdown token, so a client that disconnects does not abort them.

use crate::config::EnrichConfig;
use crate::llm::{
    base_url_for, AdapterRegistry, AdapterRequest, ChatMessage, DiscardSink, RequestContext, Role,
};
use crate::storage::{ChatStore, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const TITLE_MAX_CHARS: usize = 100;

const TITLE_INSTRUCTION: &str = "Write a short title (at most ten words) for a conversation that starts with the user's next message. Reply with the title only, without quotes or punctuation at the end.";

const SUGGESTIONS_INSTRUCTION: &str = "Given the conversation so far, propose exactly three short follow-up questions the user might ask next. Reply with a JSON array of strings and nothing else.";

/// First `n` whitespace-separated words of `text`
pub fn first_n_words(text: &str, n: usize) -> String {
    text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

fn first_n_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

/// Trim, strip surrounding quotes and cap a generated title
pub fn clean_title(raw: &str) -> String {
    let line = raw.trim().lines().next().unwrap_or("").trim();
    let unquoted = line
        .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '“' | '”'))
        .trim();
    let unlabelled = unquoted
        .strip_prefix("Title:")
        .map(str::trim)
        .unwrap_or(unquoted);
    first_n_chars(unlabelled, TITLE_MAX_CHARS)
}

/// Parse suggested questions from a model reply
///
/// Accepts a JSON array anywhere in the text, otherwise numbered or bulleted
/// lines. At most five non-empty questions are kept.
pub fn parse_suggestions(reply: &str) -> Vec<String> {
    let from_json = match (reply.find('['), reply.rfind(']')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<Vec<String>>(&reply[start..=end]).ok()
        }
        _ => None,
    };

    let questions: Vec<String> = match from_json {
        Some(items) => items,
        None => reply
            .lines()
            .map(|line| {
                line.trim()
                    .trim_start_matches(|c: char| {
                        c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*' | '•')
                    })
                    .trim()
                    .to_string()
            })
            .collect(),
    };

    questions
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .take(5)
        .collect()
}

/// Spawns and runs enrichment tasks
pub struct Enricher {
    store: Arc<dyn ChatStore>,
    registry: Arc<AdapterRegistry>,
    config: EnrichConfig,
    shutdown: CancellationToken,
}

impl Enricher {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<AdapterRegistry>,
        config: EnrichConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            shutdown,
        }
    }

    /// Title the session in the background when this was its first exchange
    pub fn spawn_title(self: &Arc<Self>, session: Session, question: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.update_title(&session, &question).await {
                tracing::warn!(session = %session.uuid, error = %e, "Title enrichment failed");
            }
        });
    }

    /// Generate suggestions for `answer_id` in the background
    ///
    /// The questions are persisted by the task itself; the receiver only
    /// lets a still-connected stream show them.
    pub fn spawn_suggestions(
        self: &Arc<Self>,
        session: Session,
        history: Vec<ChatMessage>,
        answer_id: String,
        answer: String,
    ) -> oneshot::Receiver<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.suggest(&session, history, &answer_id, &answer).await {
                Ok(questions) if !questions.is_empty() => {
                    let _ = tx.send(questions);
                }
                Ok(_) => tracing::debug!(answer_id = %answer_id, "No suggestions produced"),
                Err(e) => {
                    tracing::warn!(answer_id = %answer_id, error = %e, "Suggestion enrichment failed")
                }
            }
        });
        rx
    }

    async fn needs_title(&self, session: &Session, question: &str) -> anyhow::Result<bool> {
        let topic = session.topic.trim();
        let provisional = topic.is_empty()
            || topic.starts_with("New Chat")
            || topic == first_n_words(question, 10);
        if !provisional {
            return Ok(false);
        }

        let prompts = self
            .store
            .list_session_prompts(&self.shutdown, &session.uuid)
            .await?;
        let counts = self
            .store
            .count_session_messages(&self.shutdown, &session.uuid)
            .await?;
        let first_turn = counts.user == 1 || (counts.user == 0 && prompts.len() == 1);
        Ok(counts.assistant == 1 && first_turn)
    }

    async fn update_title(&self, session: &Session, question: &str) -> anyhow::Result<()> {
        if !self.needs_title(session, question).await? {
            return Ok(());
        }

        let generated = match self.generate_title(session, question).await {
            Ok(title) if !title.is_empty() => title,
            Ok(_) => first_n_chars(question.trim(), TITLE_MAX_CHARS),
            Err(e) => {
                tracing::debug!(session = %session.uuid, error = %e, "Falling back to question as title");
                first_n_chars(question.trim(), TITLE_MAX_CHARS)
            }
        };

        self.store
            .update_session_topic(&self.shutdown, &session.uuid, &generated)
            .await?;
        tracing::debug!(session = %session.uuid, topic = %generated, "Session titled");
        Ok(())
    }

    async fn generate_title(&self, session: &Session, question: &str) -> anyhow::Result<String> {
        let model = self
            .store
            .lookup_model(&self.shutdown, &self.config.title_model)
            .await?;
        let mut title_session = session.clone();
        title_session.model = model.name.clone();
        title_session.n = 1;
        title_session.max_tokens = 64;
        title_session.debug = false;

        let req = AdapterRequest {
            session: title_session,
            base_url: base_url_for(&model.url),
            model,
            messages: vec![
                ChatMessage::new(Role::System, TITLE_INSTRUCTION),
                ChatMessage::new(Role::User, question),
            ],
            files: Vec::new(),
            anchor_uuid: String::new(),
            regenerate: false,
            stream: false,
        };
        let answer = self.complete(&req).await?;
        Ok(clean_title(&answer))
    }

    async fn suggest(
        &self,
        session: &Session,
        mut history: Vec<ChatMessage>,
        answer_id: &str,
        answer: &str,
    ) -> anyhow::Result<Vec<String>> {
        let model = self.store.lookup_model(&self.shutdown, &session.model).await?;
        history.push(ChatMessage::new(Role::Assistant, answer));
        history.push(ChatMessage::new(Role::User, SUGGESTIONS_INSTRUCTION));

        let mut suggest_session = session.clone();
        suggest_session.n = 1;
        suggest_session.debug = false;
        let req = AdapterRequest {
            session: suggest_session,
            base_url: base_url_for(&model.url),
            model,
            messages: history,
            files: Vec::new(),
            anchor_uuid: String::new(),
            regenerate: false,
            stream: false,
        };

        let reply = self.complete(&req).await?;
        let questions = parse_suggestions(&reply);
        if !questions.is_empty() {
            self.store
                .update_message_suggestions(&self.shutdown, answer_id, &questions)
                .await?;
        }
        Ok(questions)
    }

    /// One non-streaming call under the enrichment timeout
    async fn complete(&self, req: &AdapterRequest) -> anyhow::Result<String> {
        let adapter = self.registry.select(&req.model, &req.messages);
        let ctx = RequestContext::new(self.shutdown.child_token());
        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));

        let answer = tokio::time::timeout(timeout, adapter.stream(&ctx, &mut DiscardSink, req))
            .await
            .map_err(|_| anyhow::anyhow!("enrichment timed out after {:?}", timeout))??;
        Ok(answer.answer)
    }
}
