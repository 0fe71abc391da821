//! chatpipe: multi-provider LLM chat proxy
//!
//! This library provides:
//! - An HTTP API that streams chat answers as OpenAI-shaped SSE chunks
//! - Adapters for OpenAI/Azure, Claude, Gemini, Ollama and custom completion endpoints
//! - A chat pipeline with rate gates, bounded history and answer persistence
//! - Background enrichment (session titles, suggested questions)
//! - SQLite-backed session and message storage

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use error::{ApiError, ErrorCode};
pub use pipeline::{ChatPipeline, ChatRequest};
pub use storage::{ChatStore, SqliteStore};
