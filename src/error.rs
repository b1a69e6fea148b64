//! Error types for clawbridge

use thiserror::Error;

/// Result type alias using clawbridge's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for clawbridge
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure on the gateway connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// The gateway connection dropped while work was outstanding
    #[error("Gateway connection lost")]
    ConnectionLost,

    /// The gateway rejected the connect handshake
    #[error("Gateway connect failed: {0}")]
    Handshake(String),

    /// A correlated request came back with ok=false; displays as the bare
    /// upstream message
    #[error("{0}")]
    RequestFailed(String),

    /// A run ended in the error state
    #[error("{0}")]
    RunFailed(String),

    /// A run was cancelled before finishing
    #[error("{0}")]
    RunAborted(String),

    /// Invalid client input; displays as the bare message
    #[error("{0}")]
    InvalidInput(String),

    /// Missing or invalid bearer token
    #[error("Unauthorized")]
    Unauthorized,

    /// Timeout waiting on an external resource
    #[error("Timeout: {0}")]
    Timeout(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check if the error is connection-level (the session may reconnect)
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::ConnectionLost | Error::WebSocket(_)
        )
    }

    /// Check if the error is the client's fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidInput(_) | Error::Unauthorized)
    }
}
