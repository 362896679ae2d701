//! Cross-tab announcements.
//!
//! Tabs of one origin tell each other "collection X changed" without sending
//! the data itself; a receiving tab rehydrates from the shared durable store.
//! Every message carries the sender's [`TabId`] so a tab can drop its own
//! echoes.
//!
//! The transport is a capability: [`LocalBus`] connects engines living in one
//! process, [`NoBroadcast`] stands in when no channel exists and turns every
//! call into a no-op.

use crate::CollectionName;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Random identity of one tab, fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    /// Generate a fresh tab id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message exchanged between tabs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TabMessage {
    /// A collection was written to durable storage.
    #[serde(rename = "store-updated", rename_all = "camelCase")]
    StoreUpdated {
        store: CollectionName,
        tab_id: TabId,
        /// Milliseconds since epoch
        timestamp: i64,
    },
}

/// A foreign announcement handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub collection: CollectionName,
    pub origin: TabId,
    pub timestamp: i64,
}

/// Transport between tabs. Payloads are serialized [`TabMessage`]s.
pub trait BroadcastChannel: Send + Sync {
    /// Deliver `payload` to every listener, the sender's own listeners included.
    fn post(&self, payload: String);

    /// Open a listener. `None` means the capability is absent.
    fn listen(&self) -> Option<BoxStream<'static, String>>;
}

/// In-process bus shared by every engine of one origin.
#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<String>,
}

impl LocalBus {
    /// Buffered messages per listener before slow listeners start skipping.
    const CAPACITY: usize = 256;

    /// Create a new bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastChannel for LocalBus {
    fn post(&self, payload: String) {
        // No listeners is fine: nobody else is open.
        let _ = self.sender.send(payload);
    }

    fn listen(&self) -> Option<BoxStream<'static, String>> {
        let receiver = self.sender.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => return Some((payload, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Cross-tab listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Some(stream.boxed())
    }
}

/// Null object for runtimes without a cross-tab channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBroadcast;

impl BroadcastChannel for NoBroadcast {
    fn post(&self, _payload: String) {}

    fn listen(&self) -> Option<BoxStream<'static, String>> {
        None
    }
}

/// Announces local changes and delivers foreign ones.
#[derive(Clone)]
pub struct CrossTabBroadcaster {
    tab_id: TabId,
    channel: Arc<dyn BroadcastChannel>,
}

impl CrossTabBroadcaster {
    /// Create a broadcaster for `tab_id` over `channel`.
    pub fn new(tab_id: TabId, channel: Arc<dyn BroadcastChannel>) -> Self {
        Self { tab_id, channel }
    }

    /// This tab's id.
    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// Tell other tabs that `collection` changed. Fire-and-forget.
    pub fn announce(&self, collection: &str) {
        let message = TabMessage::StoreUpdated {
            store: collection.to_string(),
            tab_id: self.tab_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        match serde_json::to_string(&message) {
            Ok(payload) => {
                tracing::trace!(collection, tab_id = %self.tab_id, "Announcing store update");
                self.channel.post(payload);
            }
            Err(e) => tracing::warn!(collection, error = %e, "Failed to encode announcement"),
        }
    }

    /// Run `handler` for every announcement from another tab.
    ///
    /// Announcements are handled one at a time, in arrival order. Own-tab
    /// echoes and undecodable messages are dropped. Returns `None` when the
    /// channel capability is absent.
    pub fn on_announcement<F, Fut>(&self, handler: F) -> Option<JoinHandle<()>>
    where
        F: Fn(Announcement) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stream = self.channel.listen()?;
        let self_id = self.tab_id.clone();
        let handler: Arc<dyn Fn(Announcement) -> BoxFuture<'static, ()> + Send + Sync> =
            Arc::new(move |announcement| Box::pin(handler(announcement)));

        Some(tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                let message: TabMessage = match serde_json::from_str(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring malformed cross-tab message");
                        continue;
                    }
                };
                let TabMessage::StoreUpdated {
                    store,
                    tab_id,
                    timestamp,
                } = message;

                if tab_id == self_id {
                    continue;
                }

                handler(Announcement {
                    collection: store,
                    origin: tab_id,
                    timestamp,
                })
                .await;
            }
        }))
    }
}

impl fmt::Debug for CrossTabBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossTabBroadcaster")
            .field("tab_id", &self.tab_id)
            .finish_non_exhaustive()
    }
}
