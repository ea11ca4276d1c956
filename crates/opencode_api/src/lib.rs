//! Transport-only client for the opencode server API.
//!
//! This crate owns request building, response decoding and SSE framing for the
//! three endpoints the viewer consumes: the session list, a session's messages,
//! and the global event stream. It has no knowledge of how events are merged
//! into client state; decoded envelopes are handed out as-is.

pub mod client;
pub mod config;
pub mod error;
pub mod retry;
pub mod sse;
pub mod types;
pub mod url;

pub use client::{await_or_cancel, is_cancelled, CancellationSignal, EventStream, OpencodeClient};
pub use config::ApiConfig;
pub use error::ApiError;
pub use retry::RetryPolicy;
pub use sse::SseStreamParser;
pub use types::{
    EventEnvelope, Message, MessageTime, MessageWithParts, Part, PartKind, Role, Session,
    SessionTime, ToolState, ToolStatus,
};
pub use url::normalize_base_url;
