//! One live push channel to a client

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use super::events::{EventSink, SseEvent, Termination};
use crate::error::{ChatcastError, Result};
use crate::types::{ClientId, ConnectionId};

/// Shared identity -> handle map owned by the registry
pub(crate) type ConnectionMap = DashMap<ClientId, Arc<ConnectionHandle>>;

/// A live push channel owned by the transport.
///
/// The registry only keeps a reference to it. Every way a connection can end
/// (supersession, timeout, transport error, failed send, stream completion)
/// goes through [`ConnectionHandle::terminate`], which closes the sink once
/// and removes the handle from its registry if, and only if, the registry
/// slot for this client still holds this exact connection.
pub struct ConnectionHandle {
    client_id: ClientId,
    connection_id: ConnectionId,
    sink: Box<dyn EventSink>,
    closed: AtomicBool,
    registry: OnceCell<Weak<ConnectionMap>>,
}

impl ConnectionHandle {
    /// Wrap a transport sink for the given client
    pub fn new(client_id: ClientId, sink: impl EventSink + 'static) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            connection_id: ConnectionId::next(),
            sink: Box::new(sink),
            closed: AtomicBool::new(false),
            registry: OnceCell::new(),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Whether the handle has been asked to complete
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one event through the transport
    pub fn send(&self, event: &SseEvent) -> Result<()> {
        if self.is_closed() {
            return Err(ChatcastError::Delivery(format!(
                "connection {} is closed",
                self.connection_id
            )));
        }
        self.sink.send(event)
    }

    /// Completion path: the stream finished or close was requested
    pub fn complete(&self) {
        self.terminate(Termination::Completed);
    }

    /// Timeout path, funnels into completion
    pub fn on_timeout(&self) {
        self.terminate(Termination::TimedOut);
    }

    /// Error path, funnels into completion
    pub fn on_error(&self, reason: impl Into<String>) {
        self.terminate(Termination::Errored(reason.into()));
    }

    /// End this connection.
    ///
    /// Returns `true` for the call that actually closed the sink. Later calls
    /// are no-ops apart from the (idempotent) registry removal.
    pub fn terminate(&self, cause: Termination) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);

        if first {
            tracing::info!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                cause = %cause,
                "Connection terminated"
            );
            self.sink.close();
        } else {
            tracing::debug!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                cause = %cause,
                "Connection already terminated"
            );
        }

        self.detach();
        first
    }

    /// Bind this handle to a registry map. Only the first binding sticks.
    pub(crate) fn attach(&self, map: Weak<ConnectionMap>) {
        let _ = self.registry.set(map);
    }

    fn detach(&self) {
        let Some(map) = self.registry.get().and_then(Weak::upgrade) else {
            return;
        };
        let removed = map
            .remove_if(&self.client_id, |_, current| {
                current.connection_id == self.connection_id
            })
            .is_some();
        if !removed {
            tracing::debug!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                "Stale removal ignored"
            );
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("client_id", &self.client_id)
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
