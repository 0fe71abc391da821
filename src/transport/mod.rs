//! Client-facing transport: HTTP routes and the SSE writer

pub mod http;
pub mod sse;

pub use http::{router, run_http_server, AppState};
pub use sse::SseEmitter;
