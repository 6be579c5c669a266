//! Live connection registry and broadcast fan-out

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::events::{SseEvent, Termination};
use super::handle::{ConnectionHandle, ConnectionMap};
use crate::error::Result;
use crate::types::{Chat, ClientId, ConnectionId};

/// A connection that could not accept an event during a broadcast
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryFailure {
    pub client_id: ClientId,
    pub connection_id: ConnectionId,
    pub reason: String,
}

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastReport {
    /// Live connections a send was attempted on
    pub attempted: usize,
    /// Connections that accepted the event
    pub delivered: usize,
    /// Connections that failed and were evicted
    pub failed: Vec<DeliveryFailure>,
}

impl BroadcastReport {
    /// True when every targeted connection accepted the event
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Who is currently reachable.
///
/// Holds at most one handle per [`ClientId`]. Cloning is cheap and every
/// clone shares the same map. Map operations are individually atomic and no
/// map lock is ever held across a send.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<ConnectionMap>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Register a freshly opened connection, superseding any prior one for
    /// the same client.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Arc<ConnectionHandle> {
        handle.attach(Arc::downgrade(&self.connections));

        let client_id = handle.client_id().clone();
        let previous = self.connections.insert(client_id.clone(), handle.clone());

        if let Some(previous) = previous {
            if previous.connection_id() != handle.connection_id() {
                tracing::info!(
                    client_id = %client_id,
                    previous = %previous.connection_id(),
                    current = %handle.connection_id(),
                    "Superseding previous connection"
                );
                previous.terminate(Termination::Superseded);
            }
        }

        // A terminate that raced the insert may have missed the new entry.
        if handle.is_closed() {
            self.unregister(&client_id, handle.connection_id());
        }

        tracing::info!(
            client_id = %client_id,
            connection_id = %handle.connection_id(),
            connections = self.connections.len(),
            "Connection registered"
        );

        handle
    }

    /// Remove the entry for `client_id` only if it still holds `connection_id`.
    ///
    /// Returns whether an entry was removed.
    pub fn unregister(&self, client_id: &ClientId, connection_id: ConnectionId) -> bool {
        self.connections
            .remove_if(client_id, |_, current| {
                current.connection_id() == connection_id
            })
            .is_some()
    }

    /// Send a chat record to every live connection
    pub fn broadcast(&self, chat: &Chat) -> Result<BroadcastReport> {
        let event = SseEvent::chat(chat)?;
        Ok(self.broadcast_event(&event))
    }

    /// Send an event to every live connection.
    ///
    /// Works on a snapshot of the map. Connections retired after the snapshot
    /// are skipped. A connection whose send fails is terminated and evicted;
    /// delivery to the rest continues.
    pub fn broadcast_event(&self, event: &SseEvent) -> BroadcastReport {
        let targets = self.snapshot();
        let mut report = BroadcastReport::default();

        for handle in targets {
            // Superseded or completed after the snapshot was taken.
            if handle.is_closed() {
                self.unregister(handle.client_id(), handle.connection_id());
                continue;
            }
            report.attempted += 1;

            match handle.send(event) {
                Ok(()) => {
                    report.delivered += 1;
                    tracing::debug!(
                        client_id = %handle.client_id(),
                        connection_id = %handle.connection_id(),
                        event = %event.name,
                        "Event delivered"
                    );
                }
                Err(_) if handle.is_closed() => {
                    report.attempted -= 1;
                    tracing::debug!(
                        client_id = %handle.client_id(),
                        connection_id = %handle.connection_id(),
                        "Connection retired during broadcast"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        client_id = %handle.client_id(),
                        connection_id = %handle.connection_id(),
                        event = %event.name,
                        error = %e,
                        "Delivery failed, evicting connection"
                    );
                    let reason = e.to_string();
                    handle.terminate(Termination::Errored(reason.clone()));
                    self.unregister(handle.client_id(), handle.connection_id());
                    report.failed.push(DeliveryFailure {
                        client_id: handle.client_id().clone(),
                        connection_id: handle.connection_id(),
                        reason,
                    });
                }
            }
        }

        report
    }

    /// Complete every live connection
    pub fn shutdown(&self) -> usize {
        let handles = self.snapshot();
        let count = handles.len();
        for handle in handles {
            handle.complete();
        }
        tracing::info!(connections = count, "Registry shut down");
        count
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a connection is registered for the client
    pub fn is_registered(&self, client_id: &ClientId) -> bool {
        self.connections.contains_key(client_id)
    }

    /// The handle currently registered for the client
    pub fn current(&self, client_id: &ClientId) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(client_id)
            .map(|entry| entry.value().clone())
    }

    fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}
