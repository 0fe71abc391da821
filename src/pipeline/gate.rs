//! Access and rate gates, evaluated before any SSE header is written

use crate::config::LimitsConfig;
use crate::error::{ApiError, ErrorCode};
use crate::storage::{ChatModel, ChatStore};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Read-only checks run against the store for every chat request
pub struct RateGate<'a> {
    store: &'a dyn ChatStore,
    limits: &'a LimitsConfig,
}

impl<'a> RateGate<'a> {
    pub fn new(store: &'a dyn ChatStore, limits: &'a LimitsConfig) -> Self {
        Self { store, limits }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.limits.window_secs)
    }

    /// Per-user sliding window
    pub async fn check_user(&self, cancel: &CancellationToken, user_id: i64) -> Result<(), ApiError> {
        let limit = self
            .store
            .get_user_rate_limit(cancel, user_id)
            .await?
            .unwrap_or(self.limits.default_rate_limit);
        let used = self
            .store
            .count_recent_messages(cancel, user_id, self.window())
            .await?;

        if used >= limit {
            tracing::info!(user = user_id, used, limit, "User rate limit reached");
            return Err(ApiError::new(ErrorCode::RateLimitUser)
                .with_detail(format!("{used} messages in the last {}s", self.limits.window_secs)));
        }
        Ok(())
    }

    /// Per-model privilege and limit, only for models that opt in
    pub async fn check_model(
        &self,
        cancel: &CancellationToken,
        user_id: i64,
        model: &ChatModel,
    ) -> Result<(), ApiError> {
        if !model.enable_per_mode_ratelimit {
            return Ok(());
        }
        let privilege = self
            .store
            .get_model_privilege(cancel, user_id, &model.name)
            .await?
            .ok_or_else(|| ApiError::new(ErrorCode::ModelAccessDenied).with_detail(model.name.clone()))?;

        let used = self
            .store
            .count_recent_model_messages(cancel, user_id, &model.name, self.window())
            .await?;
        if used >= privilege.rate_limit {
            tracing::info!(user = user_id, model = %model.name, used, "Model rate limit reached");
            return Err(ApiError::new(ErrorCode::RateLimitModel).with_detail(model.name.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::storage::{ModelPrivilege, NewMessage, Session, SqliteStore};

    async fn store_with_messages(count: usize) -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.create_session(&Session::new("s1", 7, "gpt-4o")).unwrap();
        let cancel = CancellationToken::new();
        for i in 0..count {
            store
                .insert_message(
                    &cancel,
                    NewMessage {
                        uuid: format!("m{i}"),
                        session_uuid: "s1".into(),
                        user_id: 7,
                        role: Role::User,
                        content: "hi".into(),
                        reasoning_content: String::new(),
                        token_count: 1,
                        model: "gpt-4o".into(),
                    },
                )
                .await
                .unwrap();
        }
        store
    }

    fn gated_model() -> ChatModel {
        ChatModel {
            name: "gpt-4o".into(),
            url: "http://x/v1/chat/completions".into(),
            api_auth_header: String::new(),
            api_auth_key: String::new(),
            api_type: "openai".into(),
            default_token: 0,
            max_token: 0,
            enable_per_mode_ratelimit: true,
            http_timeout_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_user_limit_from_row_or_default() {
        let store = store_with_messages(2).await;
        let cancel = CancellationToken::new();
        let limits = LimitsConfig::default();
        let gate = RateGate::new(&store, &limits);
        assert!(gate.check_user(&cancel, 7).await.is_ok());

        store.set_user_rate_limit(7, 2).unwrap();
        let err = gate.check_user(&cancel, 7).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitUser);
    }

    #[tokio::test]
    async fn test_model_gate_requires_privilege() {
        let store = store_with_messages(1).await;
        let cancel = CancellationToken::new();
        let limits = LimitsConfig::default();
        let gate = RateGate::new(&store, &limits);

        let err = gate.check_model(&cancel, 7, &gated_model()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelAccessDenied);

        store
            .grant_model_privilege(&ModelPrivilege {
                user_id: 7,
                model: "gpt-4o".into(),
                rate_limit: 1,
            })
            .unwrap();
        let err = gate.check_model(&cancel, 7, &gated_model()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitModel);

        let mut open = gated_model();
        open.enable_per_mode_ratelimit = false;
        assert!(gate.check_model(&cancel, 8, &open).await.is_ok());
    }
}
