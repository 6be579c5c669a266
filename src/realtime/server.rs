//! SSE transport and HTTP routes

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Redirect, Response,
    },
    routing::{get, post},
    Form, Json, Router,
};
use futures::Stream;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::events::{EventSink, SseEvent};
use super::handle::ConnectionHandle;
use super::service::BroadcastService;
use super::ws::ws_handler;
use crate::error::{ChatcastError, Result};
use crate::types::{ClientId, ServerConfig};

/// Bounded channel feeding one client's transport task (SSE body or WebSocket writer)
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<SseEvent>>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<SseEvent>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: &SseEvent) -> Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(ChatcastError::Delivery("stream already closed".to_string()));
        };
        tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ChatcastError::Delivery("client is not keeping up".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                ChatcastError::Delivery("client disconnected".to_string())
            }
        })
    }

    fn close(&self) {
        // Dropping the sender lets the stream drain buffered events and end.
        self.tx.lock().take();
    }
}

/// Body of one SSE response.
///
/// Dropping it (client went away, or the stream ended after `close`) reports
/// completion for its handle and cancels the lifetime watchdog.
pub struct ConnectionStream {
    events: ReceiverStream<SseEvent>,
    handle: Arc<ConnectionHandle>,
    watchdog: AbortHandle,
}

impl ConnectionStream {
    /// Wrap the receiving half and start the lifetime watchdog
    pub fn new(
        rx: mpsc::Receiver<SseEvent>,
        handle: Arc<ConnectionHandle>,
        timeout: Duration,
    ) -> Self {
        let weak: Weak<ConnectionHandle> = Arc::downgrade(&handle);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(handle) = weak.upgrade() {
                handle.on_timeout();
            }
        })
        .abort_handle();

        Self {
            events: ReceiverStream::new(rx),
            handle,
            watchdog,
        }
    }
}

impl Stream for ConnectionStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.events)
            .poll_next(cx)
            .map(|next| next.map(|event| Ok(Event::default().event(event.name).data(event.data))))
    }
}

impl Drop for ConnectionStream {
    fn drop(&mut self) {
        self.watchdog.abort();
        self.handle.complete();
    }
}

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) service: BroadcastService,
    pub(super) config: ServerConfig,
}

/// HTTP server exposing the SSE endpoint and chat routes
pub struct ChatServer {
    service: BroadcastService,
    config: ServerConfig,
}

impl ChatServer {
    pub fn new(service: BroadcastService, config: ServerConfig) -> Self {
        Self { service, config }
    }

    /// Build the router. Fails if the configuration is unusable.
    pub fn router(service: BroadcastService, config: ServerConfig) -> Result<Router> {
        config.validate()?;

        Ok(Router::new()
            .route("/", get(list_handler))
            .route("/chats", get(list_handler))
            .route("/chat", post(publish_handler))
            .route("/connect", get(connect_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(AppState { service, config }))
    }

    /// Start the server and run until Ctrl-C
    pub async fn start(self) -> Result<()> {
        let addr = self.config.bind_addr;
        let registry = self.service.registry().clone();
        let app = Self::router(self.service, self.config)?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Chat server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                tracing::info!("Shutting down");
                // Open SSE streams would otherwise hold graceful shutdown forever.
                registry.shutdown();
            })
            .await?;

        Ok(())
    }
}

impl IntoResponse for ChatcastError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ConnectParams {
    client_id: Option<String>,
}

impl ConnectParams {
    /// Identity from the query string, or a fresh one
    pub(super) fn client_id(self) -> Result<ClientId> {
        match self.client_id {
            Some(token) => ClientId::new(token),
            None => Ok(ClientId::generate()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatForm {
    msg: String,
}

/// Open a push channel for the client
async fn connect_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> std::result::Result<Sse<ConnectionStream>, ChatcastError> {
    let client_id = params.client_id()?;

    let (tx, rx) = mpsc::channel(state.config.channel_capacity);
    let handle = ConnectionHandle::new(client_id, ChannelSink::new(tx));
    let handle = state.service.connect(handle)?;

    Ok(Sse::new(ConnectionStream::new(
        rx,
        handle,
        state.config.connection_timeout,
    )))
}

/// Store a message and notify every connected client
async fn publish_handler(
    State(state): State<AppState>,
    Form(form): Form<ChatForm>,
) -> std::result::Result<Redirect, ChatcastError> {
    let service = state.service.clone();
    tokio::task::spawn_blocking(move || service.publish(&form.msg))
        .await
        .map_err(|e| ChatcastError::Internal(e.to_string()))??;

    Ok(Redirect::to("/"))
}

/// Stored messages for page population
async fn list_handler(
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ChatcastError> {
    let service = state.service.clone();
    let chats = tokio::task::spawn_blocking(move || service.list())
        .await
        .map_err(|e| ChatcastError::Internal(e.to_string()))??;

    Ok(Json(chats))
}

/// Health check endpoint
async fn health_handler(
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ChatcastError> {
    let service = state.service.clone();
    let chats = tokio::task::spawn_blocking(move || service.chat_count())
        .await
        .map_err(|e| ChatcastError::Internal(e.to_string()))??;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "connections": state.service.registry().connection_count(),
        "chats": chats,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ConnectionRegistry;
    use crate::storage::Storage;
    use crate::types::Chat;
    use axum::body::Body;
    use axum::http::{header, Request};
    use futures::StreamExt;
    use tower::ServiceExt;

    fn setup() -> (BroadcastService, Router) {
        let storage = Storage::open_in_memory().unwrap();
        let service = BroadcastService::new(Arc::new(storage), ConnectionRegistry::new());
        let router = ChatServer::router(service.clone(), ServerConfig::default()).unwrap();
        (service, router)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn client(id: &str) -> ClientId {
        ClientId::new(id).unwrap()
    }

    #[test]
    fn test_router_rejects_zero_capacity() {
        let storage = Storage::open_in_memory().unwrap();
        let service = BroadcastService::new(Arc::new(storage), ConnectionRegistry::new());
        let config = ServerConfig {
            channel_capacity: 0,
            ..Default::default()
        };

        assert!(matches!(
            ChatServer::router(service, config),
            Err(ChatcastError::Config(_))
        ));
    }

    #[test]
    fn test_channel_sink_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);

        sink.send(&SseEvent::connect()).unwrap();
        assert!(matches!(
            sink.send(&SseEvent::connect()),
            Err(ChatcastError::Delivery(_))
        ));

        drop(rx);
        let err = sink.send(&SseEvent::connect()).unwrap_err();
        assert!(err.to_string().contains("disconnected"));

        sink.close();
        assert!(sink.send(&SseEvent::connect()).is_err());
    }

    #[tokio::test]
    async fn test_publish_redirects_and_lists() {
        let (_, router) = setup();

        let response = router
            .clone()
            .oneshot(
                Request::post("/chat")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("msg=hello+world"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");

        let response = router
            .oneshot(Request::get("/chats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let chats: Vec<Chat> = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].content, "hello world");
    }

    #[tokio::test]
    async fn test_empty_message_is_bad_request() {
        let (_, router) = setup();
        let response = router
            .oneshot(
                Request::post("/chat")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("msg=+"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_connect_streams_keep_alive_then_chat() {
        let (service, router) = setup();

        let response = router
            .oneshot(
                Request::get("/connect?client_id=tab-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert!(service.registry().is_registered(&client("tab-1")));

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let first = String::from_utf8(first.to_vec()).unwrap();
        assert!(first.contains("event: connect"));
        assert!(first.contains("data: dummy-data"));

        service.publish("hi").unwrap();
        let second = body.next().await.unwrap().unwrap();
        let second = String::from_utf8(second.to_vec()).unwrap();
        assert!(second.contains("event: chat"));
        assert!(second.contains("\"content\":\"hi\""));

        drop(body);
        assert!(!service.registry().is_registered(&client("tab-1")));
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_previous_stream() {
        let (service, router) = setup();
        let request = || {
            Request::get("/connect?client_id=tab-1")
                .body(Body::empty())
                .unwrap()
        };

        let first = router.clone().oneshot(request()).await.unwrap();
        let first_id = service
            .registry()
            .current(&client("tab-1"))
            .unwrap()
            .connection_id();

        let second = router.oneshot(request()).await.unwrap();
        let current = service.registry().current(&client("tab-1")).unwrap();
        assert_ne!(current.connection_id(), first_id);
        assert_eq!(service.registry().connection_count(), 1);

        // The superseded stream ends after its buffered keep-alive.
        let mut old_body = first.into_body().into_data_stream();
        assert!(old_body.next().await.is_some());
        assert!(old_body.next().await.is_none());

        drop(old_body);
        assert!(service.registry().is_registered(&client("tab-1")));
        drop(second);
        assert!(!service.registry().is_registered(&client("tab-1")));
    }

    #[tokio::test]
    async fn test_connect_without_client_id_issues_one() {
        let (service, router) = setup();
        let response = router
            .oneshot(Request::get("/connect").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(service.registry().connection_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_times_out() {
        let storage = Storage::open_in_memory().unwrap();
        let service = BroadcastService::new(Arc::new(storage), ConnectionRegistry::new());
        let config = ServerConfig {
            connection_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let router = ChatServer::router(service.clone(), config).unwrap();

        let response = router
            .oneshot(
                Request::get("/connect?client_id=slow")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let mut body = response.into_body().into_data_stream();
        assert!(body.next().await.is_some());

        // The watchdog closes the sink, so the stream ends.
        assert!(body.next().await.is_none());
        assert!(!service.registry().is_registered(&client("slow")));
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let (service, router) = setup();
        service.publish("one").unwrap();

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
        assert_eq!(json["chats"], 1);
    }
}
