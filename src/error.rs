//! Crate-wide error taxonomy.
//!
//! Handlers return [`EngineError`] internally; the dispatcher in [`crate::server`]
//! is the only place that converts these into MCP's `{isError: true, ...}` envelope.
//! A non-zero remote exit code or a foreground timeout is *not* an `EngineError` --
//! both are represented as ordinary successful results.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad schema, missing required field, mutually exclusive options, relative
    /// path, no-op edit, ambiguous edit, unknown shell id, etc.
    #[error("{0}")]
    Validation(String),

    /// Connection lost, authentication refused, permission denied, or any other
    /// failure surfaced by the transport itself.
    #[error("transport error: {0}")]
    Transport(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
