//! Realtime invalidation socket.
//!
//! The server only talks on this socket: it pushes `{"type":"sync"}` when a
//! collection is edited out of band and answers `{"type":"ping"}`. Anything
//! else a client sends is dropped.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, ConnectionManager, ServerMessage};

/// Serve one subscriber until it closes or errors.
pub async fn handle_websocket_connection(socket: WebSocket, conn_manager: Arc<ConnectionManager>) {
    let (sink, inbound) = socket.split();
    let (outbox, queued) = mpsc::unbounded_channel::<ServerMessage>();
    let subscriber = conn_manager.register(outbox);

    let writer = tokio::spawn(drain_outbox(subscriber.clone(), queued, sink));
    read_until_closed(&subscriber, inbound, &conn_manager).await;

    conn_manager.unregister(&subscriber);
    writer.abort();
    tracing::info!(
        subscriber = %subscriber,
        remaining = conn_manager.connection_count(),
        "Realtime subscriber left"
    );
}

/// Encode queued notifications onto the socket.
async fn drain_outbox(
    subscriber: String,
    mut queued: mpsc::UnboundedReceiver<ServerMessage>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    while let Some(message) = queued.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(subscriber = %subscriber, error = %e, "Unencodable notification");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::debug!(subscriber = %subscriber, error = %e, "Subscriber stopped receiving");
            return;
        }
    }
}

async fn read_until_closed(
    subscriber: &str,
    mut inbound: SplitStream<WebSocket>,
    conn_manager: &ConnectionManager,
) {
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Ok(ClientMessage::Ping) = serde_json::from_str(text.as_str()) {
                    conn_manager.send_to(subscriber, ServerMessage::Pong);
                } else {
                    tracing::trace!(subscriber, "Dropping client text frame");
                }
            }
            Ok(Message::Close(_)) => return,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(subscriber, error = %e, "Subscriber socket failed");
                return;
            }
        }
    }
}
