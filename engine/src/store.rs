//! Durable storage - the state that survives a restart.
//!
//! A [`DurableStore`] holds one [`StoredEntry`] per collection, read and
//! written as a unit. It performs no migration: a caller reading an entry
//! written by an older schema version is responsible for upgrading it
//! (see [`crate::Migrations`]).

use crate::{error::Result, Error, NamedCollection, SchemaVersion};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The unit of durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    /// Storage key (the collection name)
    pub key: String,
    /// Schema version the payload was written with
    pub version: SchemaVersion,
    /// The collection itself
    pub payload: NamedCollection,
}

impl StoredEntry {
    /// Build the entry for a collection snapshot.
    pub fn for_collection(payload: NamedCollection) -> Self {
        Self {
            key: payload.name.clone(),
            version: payload.schema_version,
            payload,
        }
    }
}

/// Versioned asynchronous key/value persistence.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the entry stored under `key`, if any.
    async fn read(&self, key: &str) -> Result<Option<StoredEntry>>;

    /// Replace the entry stored under `entry.key`.
    async fn write(&self, entry: StoredEntry) -> Result<()>;

    /// Remove the entry stored under `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store.
///
/// Clones share the same underlying map, so handing one clone to each engine
/// models several tabs of one origin sharing browser storage. Entries are kept
/// serialized to catch payloads that would not survive a real round trip.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<StoredEntry>> {
        match self.entries.get(key) {
            Some(text) => Ok(Some(serde_json::from_str(text.value())?)),
            None => Ok(None),
        }
    }

    async fn write(&self, entry: StoredEntry) -> Result<()> {
        let text = serde_json::to_string(&entry)?;
        self.entries.insert(entry.key, text);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Directory-backed store: one JSON file per key.
///
/// Writes go to a temporary file that is then renamed over the target, so a
/// reader never observes a partially written entry. Every write gets its own
/// temporary file; handles of several tabs may share one directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }
}

/// Map a key to a safe file name stem.
fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl DurableStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<StoredEntry>> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: StoredEntry = serde_json::from_slice(&bytes)?;
        if entry.key != key {
            return Err(Error::Storage(format!(
                "entry for '{}' found under key '{}'",
                entry.key, key
            )));
        }
        Ok(Some(entry))
    }

    async fn write(&self, entry: StoredEntry) -> Result<()> {
        let target = self.path_for(&entry.key);
        let tmp = self.dir.join(format!(
            "{}.{}.tmp",
            file_stem(&entry.key),
            uuid::Uuid::new_v4().simple()
        ));
        let bytes = serde_json::to_vec(&entry)?;

        let written = match tokio::fs::write(&tmp, bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
