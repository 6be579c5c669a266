//! WebSocket transport
//!
//! Same registry, same events as `/connect`. Each event goes out as one JSON
//! text frame (`{"name": ..., "data": ...}`). Inbound `{"msg": ...}` frames
//! are published like `POST /chat`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::handle::ConnectionHandle;
use super::server::{AppState, ChannelSink, ConnectParams};
use super::service::BroadcastService;
use crate::error::ChatcastError;
use crate::types::ClientId;

/// How long a finished socket gets to flush its close frame
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct ChatFrame {
    msg: String,
}

/// WebSocket upgrade handler. The client id is checked before upgrading.
pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> std::result::Result<Response, ChatcastError> {
    let client_id = params.client_id()?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, client_id)))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, client_id: ClientId) {
    let (tx, mut rx) = mpsc::channel(state.config.channel_capacity);
    let handle = ConnectionHandle::new(client_id, ChannelSink::new(tx));
    let handle = match state.service.connect(handle) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket connect failed");
            let _ = socket.close().await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    // Drains the sink's channel. Ends with a close frame once the handle closes it.
    let writer = handle.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode event frame");
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(json)).await {
                writer.on_error(e.to_string());
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let service = state.service.clone();
    let reader = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => publish_frame(&service, &reader, &text).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    reader.on_error(e.to_string());
                    break;
                }
            }
        }
    });

    let send_done = tokio::select! {
        _ = &mut send_task => true,
        _ = &mut recv_task => false,
        _ = tokio::time::sleep(state.config.connection_timeout) => {
            handle.on_timeout();
            false
        }
    };

    handle.complete();
    recv_task.abort();
    if !send_done && tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

async fn publish_frame(service: &BroadcastService, handle: &Arc<ConnectionHandle>, text: &str) {
    let frame: ChatFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(
                connection_id = %handle.connection_id(),
                error = %e,
                "Ignoring malformed frame"
            );
            return;
        }
    };

    let service = service.clone();
    let published = tokio::task::spawn_blocking(move || service.publish(&frame.msg)).await;
    match published {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.is_client_error() => {
            tracing::debug!(connection_id = %handle.connection_id(), error = %e, "Frame rejected");
        }
        Ok(Err(e)) => tracing::error!(error = %e, "Publish from socket failed"),
        Err(e) => tracing::error!(error = %e, "Publish task failed"),
    }
}
