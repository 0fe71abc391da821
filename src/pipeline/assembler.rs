//! Conversation assembly: prompts, bounded history, artifact instructions

use crate::config::AssemblerConfig;
use crate::llm::{ChatMessage, Role};
use crate::storage::{ChatStore, Session, StoreResult, StoredMessage};
use tokio_util::sync::CancellationToken;

/// Appended to the system prompt so models emit extractable artifacts
pub const ARTIFACT_INSTRUCTIONS: &str = r#"When your answer contains a self-contained document, diagram or runnable program, wrap it in a fenced block tagged with a title comment so it can be shown as an artifact:

```html
<!-- artifact: Page title -->
...
```

Use `svg`, `mermaid` or `json` in place of `html` for those formats. For code the reader may run, use the language tag with an executable marker, for example:

```python
<!-- executable: Script title -->
...
```

Other code may use `<!-- artifact: Title -->` after the language tag."#;

/// Where history stops and how much of it to take
#[derive(Debug, Clone, Default)]
pub struct HistoryWindow {
    /// Message being regenerated; history ends strictly before it
    pub anchor_uuid: String,
    pub regenerate: bool,
}

pub struct Assembler<'a> {
    store: &'a dyn ChatStore,
    config: &'a AssemblerConfig,
}

impl<'a> Assembler<'a> {
    pub fn new(store: &'a dyn ChatStore, config: &'a AssemblerConfig) -> Self {
        Self { store, config }
    }

    fn history_limit(&self, session: &Session) -> usize {
        if session.max_length > 0 {
            session.max_length as usize
        } else {
            self.config.default_max_length
        }
    }

    /// Build the message list sent upstream for `session`
    pub async fn assemble(
        &self,
        cancel: &CancellationToken,
        session: &Session,
        window: &HistoryWindow,
    ) -> StoreResult<Vec<ChatMessage>> {
        let prompts = self.store.list_session_prompts(cancel, &session.uuid).await?;
        let limit = self.history_limit(session);

        let history = if window.regenerate && !window.anchor_uuid.is_empty() {
            self.store
                .list_messages_before(cancel, &session.uuid, &window.anchor_uuid, limit)
                .await?
        } else {
            self.store
                .list_latest_messages(cancel, &session.uuid, limit)
                .await?
        };

        let mut messages: Vec<ChatMessage> = prompts
            .into_iter()
            .map(|p| ChatMessage {
                role: p.role,
                content: p.content,
                token_count: p.token_count,
            })
            .collect();
        messages.extend(
            history
                .into_iter()
                .map(|m| self.history_message(session, m)),
        );

        if self.config.artifact_instructions {
            add_artifact_instructions(&mut messages);
        }
        Ok(messages)
    }

    fn history_message(&self, session: &Session, message: StoredMessage) -> ChatMessage {
        if session.summarize_mode && message.token_count > self.config.summarize_threshold {
            if let Some(summary) = message.summary.filter(|s| !s.is_empty()) {
                return ChatMessage::new(message.role, summary);
            }
        }
        ChatMessage {
            role: message.role,
            content: message.content,
            token_count: message.token_count,
        }
    }
}

fn add_artifact_instructions(messages: &mut Vec<ChatMessage>) {
    match messages.iter_mut().find(|m| m.role == Role::System) {
        Some(system) => {
            let content = format!("{}\n{}", system.content, ARTIFACT_INSTRUCTIONS);
            *system = ChatMessage::new(Role::System, content);
        }
        None => messages.insert(0, ChatMessage::new(Role::System, ARTIFACT_INSTRUCTIONS)),
    }
}

/// Total tokens of an assembled list
pub fn total_tokens(messages: &[ChatMessage]) -> i64 {
    messages.iter().map(|m| m.token_count).sum()
}

/// True when nothing but a system prompt would be sent
pub fn is_system_only(messages: &[ChatMessage]) -> bool {
    matches!(messages, [only] if only.role == Role::System)
}
