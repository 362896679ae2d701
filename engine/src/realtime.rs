//! Realtime invalidation channel.
//!
//! A long-lived socket to the server. The only message it acts on is
//! `{"type":"sync"}` (optionally naming a collection), which it forwards as an
//! [`Invalidation`]; the engine answers with a pull. Anything else is ignored
//! without dropping the connection.
//!
//! ```text
//! Disconnected --> Connecting --> Connected
//!      ^               |              |
//!      +---- wait reconnect_delay ----+  (on error or close)
//! ```
//!
//! The reconnect delay is fixed and retries never stop.

use crate::{error::Result, CollectionName, Error};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Default delay between a drop and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Connection state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Inbound messages the engine understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeMessage {
    /// Something changed on the server.
    Sync {
        /// Affected collection; `None` means "assume all of them".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<CollectionName>,
    },
}

/// Request to re-pull one collection, or all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub collection: Option<CollectionName>,
}

/// Text frames received on one connection; the stream ends when it closes.
pub type MessageStream = BoxStream<'static, Result<String>>;

/// Capability that opens realtime connections.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Open one connection.
    async fn connect(&self) -> Result<MessageStream>;

    /// `false` for runtimes without a realtime transport.
    fn is_available(&self) -> bool {
        true
    }
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    /// Connect to `url` (`ws://` or `wss://`).
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Endpoint this connector dials.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RealtimeConnector for WebSocketConnector {
    async fn connect(&self) -> Result<MessageStream> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;

        let stream = futures::stream::unfold(Some(socket), |socket| async move {
            let mut socket = socket?;
            loop {
                match socket.next().await? {
                    Ok(Message::Text(text)) => return Some((Ok(text), Some(socket))),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => return Some((Ok(text), Some(socket))),
                        Err(_) => tracing::debug!("Dropping non-UTF8 realtime frame"),
                    },
                    Ok(Message::Close(_)) => return None,
                    // Pings are answered by tungstenite itself.
                    Ok(_) => {}
                    // Yield the error once, then end the stream.
                    Err(e) => return Some((Err(Error::from(e)), None)),
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Null object for runtimes without a realtime transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRealtime;

#[async_trait]
impl RealtimeConnector for NoRealtime {
    async fn connect(&self) -> Result<MessageStream> {
        Err(Error::Realtime("realtime transport unavailable".into()))
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Running realtime channel. Dropping it stops the connection loop.
#[derive(Debug)]
pub struct RealtimeChannel {
    state: watch::Receiver<ChannelState>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeChannel {
    /// Start the connection loop, forwarding invalidations to `sink`.
    ///
    /// With an unavailable connector the channel stays `Disconnected` and no
    /// task is started.
    pub fn spawn(
        connector: Arc<dyn RealtimeConnector>,
        reconnect_delay: Duration,
        sink: mpsc::UnboundedSender<Invalidation>,
    ) -> Self {
        let (state_tx, state) = watch::channel(ChannelState::Disconnected);
        if !connector.is_available() {
            tracing::debug!("Realtime transport unavailable, channel disabled");
            return Self { state, task: None };
        }

        let task = tokio::spawn(run(connector, reconnect_delay, state_tx, sink));
        Self {
            state,
            task: Some(task),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Stop the connection loop.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    connector: Arc<dyn RealtimeConnector>,
    reconnect_delay: Duration,
    state: watch::Sender<ChannelState>,
    sink: mpsc::UnboundedSender<Invalidation>,
) {
    loop {
        state.send_replace(ChannelState::Connecting);
        match connector.connect().await {
            Ok(mut messages) => {
                state.send_replace(ChannelState::Connected);
                tracing::info!("Realtime channel connected");

                while let Some(message) = messages.next().await {
                    let text = match message {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "Realtime channel error");
                            break;
                        }
                    };
                    match serde_json::from_str::<RealtimeMessage>(&text) {
                        Ok(RealtimeMessage::Sync { collection }) => {
                            tracing::debug!(collection = ?collection, "Realtime invalidation");
                            if sink.send(Invalidation { collection }).is_err() {
                                // Nobody left to pull.
                                state.send_replace(ChannelState::Disconnected);
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Ignoring malformed realtime message");
                        }
                    }
                }
                tracing::info!(delay = ?reconnect_delay, "Realtime channel closed, reconnecting");
            }
            Err(e) => {
                tracing::warn!(error = %e, delay = ?reconnect_delay, "Realtime connect failed, retrying");
            }
        }

        state.send_replace(ChannelState::Disconnected);
        if sink.is_closed() {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}
