//! Core types for Chatcast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{ChatcastError, Result};

/// Unique identifier for a stored chat message
pub type ChatId = i64;

/// Maximum chat message length in characters
pub const MAX_CHAT_LENGTH: usize = 1000;

/// A durably stored chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Unique identifier
    pub id: ChatId,
    /// Message body
    pub content: String,
    /// When the message was stored
    pub created_at: DateTime<Utc>,
}

/// Opaque per-session token identifying a logical client across reconnects.
///
/// Tokens are compared byte for byte: `" tab "` and `"tab"` are different
/// clients. Deserialization goes through the same check as [`ClientId::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Create a client identity, rejecting empty or all-whitespace tokens
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ChatcastError::InvalidInput(
                "client id must not be blank".to_string(),
            ));
        }
        Ok(Self(token))
    }

    /// Issue a fresh random identity
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ClientId {
    type Error = ChatcastError;

    fn try_from(token: String) -> Result<Self> {
        Self::new(token)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Process-unique identifier for one push channel.
///
/// Two handles registered under the same [`ClientId`] always carry different
/// connection ids, which is what makes removal reference-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate the next connection id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database (":memory:" for an in-memory database)
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
        }
    }
}

/// HTTP / SSE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// Lifetime of a push connection before the server closes it
    #[serde(default = "default_connection_timeout", with = "duration_secs")]
    pub connection_timeout: Duration,
    /// Events buffered per connection before a send counts as failed
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            connection_timeout: default_connection_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ServerConfig {
    /// Reject settings the transport cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout.is_zero() {
            return Err(ChatcastError::Config(
                "connection timeout must be greater than zero".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ChatcastError::Config(
                "channel capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
