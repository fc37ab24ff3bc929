//! Error categories shared across the ingestion and storage core.
//!
//! These map directly onto the error categories handlers are expected to
//! react to: a malformed wire record closes the connection it arrived on, a
//! full queue drops the entry, and storage I/O failures are logged and
//! skipped rather than retried. See each call site for the specific
//! recovery behavior.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("wire format error: {0}")]
    WireFormat(String),

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("queue overflow: {kind}")]
    QueueOverflow { kind: &'static str },

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid session")]
    SessionInvalid,

    #[error("agent unavailable: obj_hash={obj_hash}")]
    AgentUnavailable { obj_hash: i32 },
}

pub type Result<T> = std::result::Result<T, ServerError>;
