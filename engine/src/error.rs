//! Error types for the tabsync engine.

use crate::{CollectionName, EntityId, SchemaVersion};
use thiserror::Error;

/// All possible errors from the tabsync engine.
///
/// Most of these never reach collaborators: the sync entry points (pull, the
/// push timer, the realtime loop, the cross-tab listener) log and swallow
/// them. They surface only from direct calls such as [`crate::LocalReplica::apply`]
/// or [`crate::DurableStore::write`].
#[derive(Debug, Error)]
pub enum Error {
    // Entity errors
    #[error("entity has no string id: {0}")]
    MissingId(String),

    #[error("duplicate entity id in collection '{collection}': {id}")]
    DuplicateId {
        collection: CollectionName,
        id: EntityId,
    },

    #[error("collection not registered: {0}")]
    UnknownCollection(CollectionName),

    #[error("collection is not synced with the server: {0}")]
    NotServerSynced(CollectionName),

    // Persistence errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("unsupported schema version for '{collection}': stored {stored}, running {running}")]
    UnsupportedVersion {
        collection: CollectionName,
        stored: SchemaVersion,
        running: SchemaVersion,
    },

    #[error("no migration for '{collection}' from schema version {from}")]
    MissingMigration {
        collection: CollectionName,
        from: SchemaVersion,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Network errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server responded with status {status}")]
    Http { status: u16 },

    #[error("realtime channel error: {0}")]
    Realtime(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Error::Http {
                status: status.as_u16(),
            },
            None => Error::Transport(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Realtime(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownCollection("projects".into());
        assert_eq!(err.to_string(), "collection not registered: projects");

        let err = Error::DuplicateId {
            collection: "projects".into(),
            id: "p1".into(),
        };
        assert_eq!(
            err.to_string(),
            "duplicate entity id in collection 'projects': p1"
        );

        let err = Error::UnsupportedVersion {
            collection: "projects".into(),
            stored: 4,
            running: 2,
        };
        assert_eq!(
            err.to_string(),
            "unsupported schema version for 'projects': stored 4, running 2"
        );

        let err = Error::Http { status: 503 };
        assert_eq!(err.to_string(), "server responded with status 503");
    }

    #[test]
    fn io_errors_map_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(Error::from(io), Error::Storage(msg) if msg.contains("denied")));
    }
}
