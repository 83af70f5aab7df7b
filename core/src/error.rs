/// Error types for the sync client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No credentials available")]
    MissingCredentials,

    #[error("Conversation {0} is not active")]
    InactiveConversation(String),

    #[error("Invalid intent: {0}")]
    InvalidIntent(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl SyncError {
    /// HTTP status carried by a rejected request, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
