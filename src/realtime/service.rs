//! Bridges durable chat records to live connections

use std::sync::Arc;

use super::events::{SseEvent, Termination};
use super::handle::ConnectionHandle;
use super::registry::{BroadcastReport, ConnectionRegistry};
use crate::error::{ChatcastError, Result};
use crate::storage::ChatStore;
use crate::types::Chat;

/// Connect / publish / list entry points used by the HTTP layer
#[derive(Clone)]
pub struct BroadcastService {
    store: Arc<dyn ChatStore>,
    registry: ConnectionRegistry,
}

impl BroadcastService {
    pub fn new(store: Arc<dyn ChatStore>, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Register a new connection and send the keep-alive event.
    ///
    /// If the keep-alive cannot be written the connection is terminated and
    /// never counts as live.
    pub fn connect(&self, handle: Arc<ConnectionHandle>) -> Result<Arc<ConnectionHandle>> {
        let handle = self.registry.register(handle);

        if let Err(e) = handle.send(&SseEvent::connect()) {
            tracing::warn!(
                client_id = %handle.client_id(),
                connection_id = %handle.connection_id(),
                error = %e,
                "Keep-alive send failed"
            );
            handle.terminate(Termination::Errored(e.to_string()));
            return Err(ChatcastError::ConnectionEstablishment {
                client_id: handle.client_id().to_string(),
                reason: e.to_string(),
            });
        }

        Ok(handle)
    }

    /// Store a message and fan it out. Delivery problems never fail the publish.
    pub fn publish(&self, content: &str) -> Result<Chat> {
        self.publish_with_report(content).map(|(chat, _)| chat)
    }

    /// Like [`publish`](Self::publish), also returning the fan-out outcome
    pub fn publish_with_report(&self, content: &str) -> Result<(Chat, BroadcastReport)> {
        let chat = self.store.append(content)?;

        let report = match self.registry.broadcast(&chat) {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(chat_id = chat.id, error = %e, "Failed to encode chat event");
                BroadcastReport::default()
            }
        };

        if report.is_complete() {
            tracing::info!(
                chat_id = chat.id,
                delivered = report.delivered,
                "Chat published"
            );
        } else {
            tracing::warn!(
                chat_id = chat.id,
                delivered = report.delivered,
                failed = report.failed.len(),
                "Chat published with delivery failures"
            );
        }

        Ok((chat, report))
    }

    /// Stored messages for initial page population
    pub fn list(&self) -> Result<Vec<Chat>> {
        self.store.list()
    }

    /// Number of stored messages
    pub fn chat_count(&self) -> Result<i64> {
        self.store.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::events::EventSink;
    use crate::storage::Storage;
    use crate::types::ClientId;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct TestSink {
        events: Mutex<Vec<SseEvent>>,
        fail: AtomicBool,
    }

    impl EventSink for TestSink {
        fn send(&self, event: &SseEvent) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChatcastError::Delivery("closed".into()));
            }
            self.events.lock().push(event.clone());
            Ok(())
        }

        fn close(&self) {}
    }

    struct FailingStore;

    impl ChatStore for FailingStore {
        fn append(&self, _content: &str) -> Result<Chat> {
            Err(ChatcastError::Storage("disk full".into()))
        }

        fn list(&self) -> Result<Vec<Chat>> {
            Err(ChatcastError::Storage("disk full".into()))
        }
    }

    fn service() -> BroadcastService {
        let storage = Storage::open_in_memory().unwrap();
        BroadcastService::new(Arc::new(storage), ConnectionRegistry::new())
    }

    fn handle(id: &str, sink: &Arc<TestSink>) -> Arc<ConnectionHandle> {
        ConnectionHandle::new(ClientId::new(id).unwrap(), sink.clone())
    }

    #[test]
    fn test_connect_sends_keep_alive() {
        let service = service();
        let sink = Arc::new(TestSink::default());
        service.connect(handle("a", &sink)).unwrap();

        let events = sink.events.lock();
        assert_eq!(events.as_slice(), &[SseEvent::connect()]);
        assert_eq!(service.registry().connection_count(), 1);
    }

    #[test]
    fn test_connect_fails_when_keep_alive_fails() {
        let service = service();
        let sink = Arc::new(TestSink::default());
        sink.fail.store(true, Ordering::SeqCst);

        let err = service.connect(handle("a", &sink)).unwrap_err();
        assert!(matches!(err, ChatcastError::ConnectionEstablishment { .. }));
        assert_eq!(service.registry().connection_count(), 0);
    }

    #[test]
    fn test_publish_persists_and_broadcasts() {
        let service = service();
        let sink = Arc::new(TestSink::default());
        service.connect(handle("a", &sink)).unwrap();

        let chat = service.publish("hi").unwrap();
        assert_eq!(chat.content, "hi");

        let events = sink.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], SseEvent::chat(&chat).unwrap());
        drop(events);

        assert_eq!(service.list().unwrap(), vec![chat]);
        assert_eq!(service.chat_count().unwrap(), 1);
    }

    #[test]
    fn test_publish_succeeds_despite_delivery_failures() {
        let service = service();
        let good = Arc::new(TestSink::default());
        let bad = Arc::new(TestSink::default());
        service.connect(handle("good", &good)).unwrap();
        service.connect(handle("bad", &bad)).unwrap();
        bad.fail.store(true, Ordering::SeqCst);

        let (chat, report) = service.publish_with_report("hello").unwrap();
        assert_eq!(chat.content, "hello");
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(service.registry().connection_count(), 1);
    }

    #[test]
    fn test_publish_without_connections() {
        let service = service();
        let (_, report) = service.publish_with_report("nobody home").unwrap();
        assert_eq!(report.attempted, 0);
    }

    #[test]
    fn test_persistence_failure_propagates_without_broadcast() {
        let service = BroadcastService::new(Arc::new(FailingStore), ConnectionRegistry::new());
        let sink = Arc::new(TestSink::default());
        service.connect(handle("a", &sink)).unwrap();

        let err = service.publish("hi").unwrap_err();
        assert!(matches!(err, ChatcastError::Storage(_)));
        assert_eq!(sink.events.lock().len(), 1);
        assert!(service.list().is_err());
    }

    #[test]
    fn test_invalid_content_is_rejected() {
        let service = service();
        assert!(matches!(
            service.publish("   "),
            Err(ChatcastError::InvalidInput(_))
        ));
    }
}
