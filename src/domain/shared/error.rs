//! Domain errors

use thiserror::Error;

/// Errors surfaced by the session API
///
/// Transport and decode failures never appear here; they are handled
/// inside the workers (retry, reconnect, discard).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid transport: {0}")]
    InvalidTransport(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Session is not running")]
    NotRunning,

    #[error("Unknown call: {0}")]
    UnknownCall(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
