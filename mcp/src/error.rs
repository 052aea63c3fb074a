//! Gateway error types.
//!
//! Defines error variants for southbound transport, catalog routing and
//! protocol decoding failures.

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    /// The southbound reader exited while requests were outstanding.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A per-call deadline elapsed. Distinct from cancellation.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The caller's cancellation signal fired.
    #[error("Cancelled")]
    Cancelled,

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
