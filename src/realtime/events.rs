//! Real-time event types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::types::Chat;

/// Event name for published chat messages
pub const CHAT_EVENT: &str = "chat";

/// Event name for the keep-alive sent right after a connection opens
pub const CONNECT_EVENT: &str = "connect";

/// Payload of the keep-alive event
pub const CONNECT_PAYLOAD: &str = "dummy-data";

/// A named event as written to a push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseEvent {
    /// Event name (`event:` field)
    pub name: String,
    /// Serialized payload (`data:` field)
    pub data: String,
}

impl SseEvent {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// The keep-alive sent immediately after registration
    pub fn connect() -> Self {
        Self::new(CONNECT_EVENT, CONNECT_PAYLOAD)
    }

    /// A chat record serialized as JSON
    pub fn chat(chat: &Chat) -> Result<Self> {
        Ok(Self::new(CHAT_EVENT, serde_json::to_string(chat)?))
    }
}

/// Why a connection left the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// A newer connection registered under the same client id
    Superseded,
    /// The transport's connection lifetime elapsed
    TimedOut,
    /// The transport reported an error, or a send through the connection failed
    Errored(String),
    /// The transport finished the stream (client went away or close was requested)
    Completed,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Superseded => "superseded",
            Termination::TimedOut => "timed_out",
            Termination::Errored(_) => "errored",
            Termination::Completed => "completed",
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Errored(reason) => write!(f, "errored: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Transport-side send capability of one push channel.
///
/// Implementations must not block: a send either hands the event to the
/// transport or fails with [`ChatcastError::Delivery`](crate::error::ChatcastError::Delivery).
pub trait EventSink: Send + Sync {
    /// Write one event to the client
    fn send(&self, event: &SseEvent) -> Result<()>;

    /// Ask the transport to finish the stream. Called at most once per handle.
    fn close(&self);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn send(&self, event: &SseEvent) -> Result<()> {
        (**self).send(event)
    }

    fn close(&self) {
        (**self).close()
    }
}
