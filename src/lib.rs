//! Chatcast - live chat broadcast over Server-Sent Events
//!
//! Durable chat messages in SQLite, fanned out to every connected browser
//! tab through a connection registry that survives reconnect churn.

pub mod error;
pub mod realtime;
pub mod storage;
pub mod types;

pub use error::{ChatcastError, Result};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
