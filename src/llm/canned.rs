//! Hermetic test adapter
//!
//! Selected whenever a conversation carries the demo marker, so end-to-end
//! checks run without any provider.

use super::{
    forward, openai, AdapterRequest, AnswerId, CandidateBuffers, ChatAdapter, ChatMessage, Delta,
    DeltaSink, LlmAnswer, LlmError, RequestContext,
};
use async_trait::async_trait;

pub const TEST_MARKER: &str = "test_demo_bestqa";

pub const CANNED_ANSWER: &str = "Hi, I am a chatbot. I can help you to find the best answer for your question. Please ask me a question.";

/// True when the first or last message starts with the demo marker
pub fn is_test_marker(messages: &[ChatMessage]) -> bool {
    let starts = |m: Option<&ChatMessage>| m.is_some_and(|m| m.content.starts_with(TEST_MARKER));
    starts(messages.first()) || starts(messages.last())
}

#[derive(Debug, Default)]
pub struct CannedAdapter;

#[async_trait]
impl ChatAdapter for CannedAdapter {
    fn name(&self) -> &'static str {
        "test"
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        sink: &mut dyn DeltaSink,
        req: &AdapterRequest,
    ) -> Result<LlmAnswer, LlmError> {
        let mut answer_id = AnswerId::for_request(req);
        answer_id.adopt(None);
        let mut buffers = CandidateBuffers::new();

        let mut pieces = vec![CANNED_ANSWER.to_string()];
        if req.session.debug {
            let body = serde_json::to_string_pretty(&openai::build_request(req))
                .map_err(|e| LlmError::Other(e.into()))?;
            pieces.push(format!("\n{body}"));
        }

        for piece in pieces {
            if ctx.cancel.is_cancelled() {
                break;
            }
            buffers.push(0, &piece);
            if req.stream && !forward(sink, Delta::content(&answer_id, 0, piece)).await {
                break;
            }
        }

        Ok(buffers.finish(&answer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fixtures::{self, CollectSink};
    use crate::llm::Role;

    #[test]
    fn test_marker_on_first_or_last() {
        let first = vec![
            ChatMessage::new(Role::System, "test_demo_bestqa"),
            ChatMessage::new(Role::User, "hi"),
        ];
        let last = vec![
            ChatMessage::new(Role::System, "sys"),
            ChatMessage::new(Role::User, "test_demo_bestqa please"),
        ];
        let middle = vec![
            ChatMessage::new(Role::System, "sys"),
            ChatMessage::new(Role::User, "test_demo_bestqa"),
            ChatMessage::new(Role::Assistant, "x"),
        ];
        assert!(is_test_marker(&first));
        assert!(is_test_marker(&last));
        assert!(!is_test_marker(&middle));
        assert!(!is_test_marker(&[]));
    }

    #[tokio::test]
    async fn test_canned_answer_with_debug_body() {
        let model = fixtures::model("gpt-4o", "openai", "http://x/v1/chat/completions");
        let mut req = fixtures::request(model, fixtures::conversation());
        req.session.debug = true;

        let mut sink = CollectSink::default();
        let answer = CannedAdapter
            .stream(&RequestContext::detached(), &mut sink, &req)
            .await
            .unwrap();

        let contents = sink.contents();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0], CANNED_ANSWER);
        assert!(contents[1].starts_with('\n'));
        assert!(contents[1].contains("\"messages\""));
        assert_eq!(answer.answer, contents.concat());
    }
}
