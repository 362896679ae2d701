//! WebSocket message protocol definitions.
//!
//! All messages are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Server data changed; clients should pull.
    Sync {
        /// Collection that changed
        #[serde(skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
    },

    /// Response to ping.
    Pong,
}

impl ServerMessage {
    /// Invalidation for one collection.
    pub fn sync(collection: impl Into<String>) -> Self {
        ServerMessage::Sync {
            collection: Some(collection.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_engine::RealtimeMessage;

    #[test]
    fn test_client_message_deserialization() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "pull"}"#).is_err());
    }

    #[test]
    fn test_server_message_serialization() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let json = serde_json::to_string(&ServerMessage::sync("projects")).unwrap();
        assert_eq!(json, r#"{"type":"sync","collection":"projects"}"#);
    }

    #[test]
    fn sync_is_understood_by_the_engine() {
        let json = serde_json::to_string(&ServerMessage::sync("pages")).unwrap();
        let parsed: RealtimeMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed,
            RealtimeMessage::Sync {
                collection: Some("pages".into())
            }
        );
    }
}
