//! Storage engine for Chatcast
//!
//! Durable chat records backed by SQLite.

mod connection;
mod migrations;
pub mod queries;

pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;

use crate::error::Result;
use crate::types::Chat;

/// Persistence collaborator used by the broadcast service
pub trait ChatStore: Send + Sync {
    /// Durably record a message and return the stored record
    fn append(&self, content: &str) -> Result<Chat>;

    /// All stored records, oldest first
    fn list(&self) -> Result<Vec<Chat>>;

    /// Number of stored records
    fn count(&self) -> Result<i64> {
        self.list().map(|chats| chats.len() as i64)
    }
}
