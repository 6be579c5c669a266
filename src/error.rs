//! Error types for Chatcast

use thiserror::Error;

/// Result type alias for Chatcast operations
pub type Result<T> = std::result::Result<T, ChatcastError>;

/// Main error type for Chatcast
#[derive(Error, Debug)]
pub enum ChatcastError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The keep-alive event could not be written to a freshly opened connection
    #[error("Connection establishment failed for client {client_id}: {reason}")]
    ConnectionEstablishment { client_id: String, reason: String },

    /// A single connection could not accept an event
    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatcastError {
    /// Whether the caller supplied something invalid (as opposed to a server fault)
    pub fn is_client_error(&self) -> bool {
        matches!(self, ChatcastError::InvalidInput(_))
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ChatcastError::InvalidInput(_) => 400,
            ChatcastError::ConnectionEstablishment { .. } | ChatcastError::Delivery(_) => 503,
            _ => 500,
        }
    }
}
