//! # Tabsync Engine
//!
//! A client-resident sync engine that keeps named document collections
//! consistent between three writers: the local tab, sibling tabs sharing the
//! same durable store, and a server that may be edited out of band.
//!
//! ## Data flow
//!
//! ```text
//!            local edit / pull / cross-tab rehydrate
//!                             |
//!                             v
//!                      +--------------+
//!                      | LocalReplica |---- Changed ----> push timer (debounced)
//!                      +--------------+
//!                             |
//!                        durable write
//!                             |
//!                             v
//!                      +--------------+
//!                      | DurableStore |---- Persisted --> cross-tab announce
//!                      +--------------+
//! ```
//!
//! - [`LocalReplica`] holds the in-memory snapshot of one collection. Reads
//!   see every write immediately; persistence follows asynchronously.
//! - [`CrossTabBroadcaster`] tells sibling tabs a collection changed; they
//!   reload it from the shared [`DurableStore`].
//! - [`ServerSyncCoordinator`] pushes the full collection after a quiet
//!   period, and pulls with "local-only first, then server" merge semantics.
//!   A pull bumps a generation counter that cancels any push scheduled
//!   before it.
//! - [`RealtimeChannel`] listens for `{"type":"sync"}` and triggers pulls.
//! - [`SyncEngine`] sequences startup and owns all of the above.
//!
//! Entities are opaque JSON objects identified by a string `id`; the engine
//! never looks inside them beyond that.

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod migrate;
pub mod realtime;
pub mod remote;
pub mod replica;
pub mod store;
pub mod sync;

pub use broadcast::{
    Announcement, BroadcastChannel, CrossTabBroadcaster, LocalBus, NoBroadcast, TabId, TabMessage,
};
pub use config::{ConfigError, EngineConfig};
pub use engine::{CollectionSpec, Seeder, SyncEngine, SyncEngineBuilder, SyncPolicy};
pub use entity::{validate_unique_ids, Entity, NamedCollection};
pub use error::{Error, Result};
pub use migrate::Migrations;
pub use realtime::{
    ChannelState, Invalidation, NoRealtime, RealtimeChannel, RealtimeConnector, RealtimeMessage,
    WebSocketConnector,
};
pub use remote::{HttpRemote, PushBody, RemoteApi, CONFIRM_HEADER, CONFIRM_OVERWRITE};
pub use replica::{ChangeOrigin, LocalReplica, ReplicaEvent, Revision, Subscription};
pub use store::{DurableStore, FileStore, MemoryStore, StoredEntry};
pub use sync::{merge, Generation, Merged, PullOutcome, PushPhase, ServerSyncCoordinator, SyncState};

/// Name of a collection; doubles as its durable storage key.
pub type CollectionName = String;

/// Entity identifier.
pub type EntityId = String;

/// Schema version of a stored collection.
pub type SchemaVersion = u32;
