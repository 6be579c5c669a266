//! Real-time chat delivery over Server-Sent Events and WebSocket
//!
//! Keeps one push channel per client, supersedes it on reconnect and fans
//! every published chat out to all live channels.

mod events;
mod handle;
mod registry;
mod server;
mod service;
mod ws;

pub use events::{
    EventSink, SseEvent, Termination, CHAT_EVENT, CONNECT_EVENT, CONNECT_PAYLOAD,
};
pub use handle::ConnectionHandle;
pub use registry::{BroadcastReport, ConnectionRegistry, DeliveryFailure};
pub use server::{ChannelSink, ChatServer, ConnectionStream};
pub use service::BroadcastService;
