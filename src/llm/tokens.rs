//! Token counting
//!
//! Uses the `cl100k_base` BPE when it can be built and falls back to a
//! four-characters-per-token estimate otherwise.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

static CL100K: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!("cl100k_base unavailable, estimating tokens: {}", e);
        None
    }
});

/// Tokens in `text`
pub fn count_tokens(text: &str) -> i64 {
    match CL100K.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as i64,
        None => text.len().div_ceil(4) as i64,
    }
}

/// Tokens for one message, including a one-token envelope
pub fn message_tokens(content: &str) -> i64 {
    count_tokens(content) + 1
}
