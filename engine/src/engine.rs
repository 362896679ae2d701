//! Startup sequencing and the per-tab engine handle.
//!
//! [`SyncEngine::builder`] wires every component together. For each
//! registered collection, `start` runs in order:
//!
//! 1. rehydrate the replica from durable storage, seeding it when still empty
//! 2. pull every server-synced collection
//! 3. open the realtime channel
//! 4. observe replica changes to drive pushes and cross-tab announcements
//!
//! ## Example
//!
//! ```rust,no_run
//! use tabsync_engine::{CollectionSpec, EngineConfig, LocalBus, SyncEngine};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> tabsync_engine::Result<()> {
//! let config = EngineConfig::from_env()?;
//! let engine = SyncEngine::builder(config)
//!     .broadcast(Arc::new(LocalBus::new()))
//!     .collection(CollectionSpec::server("projects", 1))
//!     .start()
//!     .await?;
//!
//! let project = tabsync_engine::Entity::new(json!({"id": "p1", "name": "Roof"}))?;
//! engine.apply("projects", |items| items.push(project))?;
//! # Ok(())
//! # }
//! ```

use crate::broadcast::{BroadcastChannel, CrossTabBroadcaster, NoBroadcast, TabId};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::realtime::{
    ChannelState, Invalidation, RealtimeChannel, RealtimeConnector, WebSocketConnector,
};
use crate::remote::{HttpRemote, RemoteApi};
use crate::replica::{ChangeOrigin, LocalReplica, ReplicaEvent, Subscription};
use crate::store::{DurableStore, FileStore, MemoryStore};
use crate::sync::{PullOutcome, ServerSyncCoordinator};
use crate::{CollectionName, Entity, Error, Migrations, SchemaVersion};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Whether a collection talks to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Pushed to and pulled from the server, and shared across tabs.
    Server,
    /// Shared across tabs only.
    TabsOnly,
}

/// Registration of one collection.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub name: CollectionName,
    pub schema_version: SchemaVersion,
    pub policy: SyncPolicy,
    pub migrations: Migrations,
}

impl CollectionSpec {
    /// A server-synced collection.
    pub fn server(name: impl Into<CollectionName>, schema_version: SchemaVersion) -> Self {
        Self {
            name: name.into(),
            schema_version,
            policy: SyncPolicy::Server,
            migrations: Migrations::new(),
        }
    }

    /// A collection shared between tabs but never sent to the server.
    pub fn tabs_only(name: impl Into<CollectionName>, schema_version: SchemaVersion) -> Self {
        Self {
            policy: SyncPolicy::TabsOnly,
            ..Self::server(name, schema_version)
        }
    }

    /// Attach schema migrations.
    pub fn with_migrations(mut self, migrations: Migrations) -> Self {
        self.migrations = migrations;
        self
    }
}

/// Supplies initial data for collections that are empty after rehydration.
pub trait Seeder: Send + Sync {
    /// Items for `collection`, or `None` to leave it empty.
    fn seed(&self, collection: &str) -> Option<Vec<Entity>>;
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: EngineConfig,
    tab_id: Option<TabId>,
    store: Option<Arc<dyn DurableStore>>,
    broadcast: Arc<dyn BroadcastChannel>,
    remote: Option<Arc<dyn RemoteApi>>,
    realtime: Option<Arc<dyn RealtimeConnector>>,
    seeder: Option<Arc<dyn Seeder>>,
    collections: Vec<CollectionSpec>,
}

impl SyncEngineBuilder {
    /// Use a fixed tab id instead of a random one.
    pub fn tab_id(mut self, tab_id: TabId) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    /// Durable store. Defaults to a [`FileStore`] under `data_dir`, or a
    /// private [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Cross-tab channel. Defaults to [`NoBroadcast`].
    pub fn broadcast(mut self, channel: Arc<dyn BroadcastChannel>) -> Self {
        self.broadcast = channel;
        self
    }

    /// Server API. Defaults to [`HttpRemote`] at `server_url`.
    pub fn remote(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Realtime transport. Defaults to [`WebSocketConnector`] at `realtime_url`.
    pub fn realtime(mut self, connector: Arc<dyn RealtimeConnector>) -> Self {
        self.realtime = Some(connector);
        self
    }

    /// Seed data provider.
    pub fn seeder(mut self, seeder: Arc<dyn Seeder>) -> Self {
        self.seeder = Some(seeder);
        self
    }

    /// Register a collection.
    pub fn collection(mut self, spec: CollectionSpec) -> Self {
        self.collections.push(spec);
        self
    }

    /// Run the startup sequence and return the running engine.
    pub async fn start(self) -> Result<SyncEngine> {
        let store: Arc<dyn DurableStore> = match (self.store, &self.config.data_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileStore::open(dir).await?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let remote: Arc<dyn RemoteApi> = match self.remote {
            Some(remote) => remote,
            None => Arc::new(HttpRemote::new(self.config.server_url.clone())),
        };
        let connector: Arc<dyn RealtimeConnector> = match self.realtime {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new(self.config.realtime_url.clone())),
        };
        let tab_id = self.tab_id.unwrap_or_else(TabId::generate);
        let broadcaster = CrossTabBroadcaster::new(tab_id.clone(), self.broadcast);

        tracing::info!(tab_id = %tab_id, collections = self.collections.len(), "Starting sync engine");

        // Rehydrate, then seed.
        let mut collections = BTreeMap::new();
        for spec in self.collections {
            if collections.contains_key(&spec.name) {
                return Err(Error::Config(format!(
                    "collection registered twice: {}",
                    spec.name
                )));
            }
            let replica = LocalReplica::new(
                spec.name.clone(),
                spec.schema_version,
                store.clone(),
                spec.migrations,
            );
            if let Err(e) = replica.rehydrate().await {
                tracing::warn!(collection = %spec.name, error = %e, "Rehydrate failed, starting empty");
            }
            if replica.is_empty() {
                if let Some(items) = self.seeder.as_ref().and_then(|s| s.seed(&spec.name)) {
                    tracing::debug!(collection = %spec.name, count = items.len(), "Seeding collection");
                    if let Err(e) = replica.seed(items) {
                        tracing::warn!(collection = %spec.name, error = %e, "Seed data rejected");
                    }
                }
            }
            let coordinator =
                ServerSyncCoordinator::new(replica, remote.clone(), self.config.push_debounce);
            collections.insert(
                spec.name,
                ManagedCollection {
                    policy: spec.policy,
                    coordinator,
                },
            );
        }
        let collections = Arc::new(collections);

        // A durable snapshot from an earlier session must not shadow newer
        // server state.
        pull_all(&collections).await;

        let (sink, invalidations) = mpsc::unbounded_channel();
        let realtime = RealtimeChannel::spawn(connector, self.config.reconnect_delay, sink);
        let mut tasks = vec![tokio::spawn(consume_invalidations(
            collections.clone(),
            invalidations,
        ))];

        let mut subscriptions = Vec::new();
        for (name, managed) in collections.iter() {
            if managed.policy == SyncPolicy::Server {
                subscriptions.push(managed.coordinator.watch_local_changes());
            }
            subscriptions.push(announce_persisted(
                name.clone(),
                managed.coordinator.replica(),
                broadcaster.clone(),
            ));
        }

        let listening = collections.clone();
        let listener = broadcaster.on_announcement(move |announcement| {
            let collections = listening.clone();
            async move {
                let Some(managed) = collections.get(&announcement.collection) else {
                    tracing::trace!(collection = %announcement.collection, "Ignoring announcement for unmanaged collection");
                    return;
                };
                tracing::debug!(
                    collection = %announcement.collection,
                    from = %announcement.origin,
                    "Applying update from another tab"
                );
                if let Err(e) = managed.coordinator.apply_external_update().await {
                    tracing::warn!(collection = %announcement.collection, error = %e, "Cross-tab rehydrate failed");
                }
            }
        });
        tasks.extend(listener);

        Ok(SyncEngine {
            tab_id,
            collections,
            realtime,
            tasks,
            subscriptions,
        })
    }
}

struct ManagedCollection {
    policy: SyncPolicy,
    coordinator: ServerSyncCoordinator,
}

type Collections = Arc<BTreeMap<CollectionName, ManagedCollection>>;

async fn pull_all(collections: &Collections) {
    let pulls = collections
        .values()
        .filter(|managed| managed.policy == SyncPolicy::Server)
        .map(|managed| managed.coordinator.pull());
    futures::future::join_all(pulls).await;
}

async fn consume_invalidations(
    collections: Collections,
    mut invalidations: mpsc::UnboundedReceiver<Invalidation>,
) {
    while let Some(invalidation) = invalidations.recv().await {
        match invalidation.collection {
            None => pull_all(&collections).await,
            Some(name) => match collections.get(&name) {
                Some(managed) if managed.policy == SyncPolicy::Server => {
                    managed.coordinator.pull().await;
                }
                _ => tracing::debug!(collection = %name, "Ignoring invalidation for unsynced collection"),
            },
        }
    }
}

/// Announce every durable write made by this tab: local edits and pulls.
///
/// Writes caused by another tab carry [`ChangeOrigin::Rehydrate`] and are
/// filtered out by origin, so a local edit persisted while a cross-tab reload
/// is still running is announced like any other.
fn announce_persisted(
    name: CollectionName,
    replica: &LocalReplica,
    broadcaster: CrossTabBroadcaster,
) -> Subscription {
    replica.subscribe(move |event| {
        if let ReplicaEvent::Persisted {
            origin: ChangeOrigin::Local | ChangeOrigin::Pull,
            ..
        } = event
        {
            broadcaster.announce(&name);
        }
    })
}

/// One tab's running sync engine.
///
/// Dropping it stops the realtime channel, the cross-tab listener and all
/// change observers. Use [`SyncEngine::shutdown`] to also wait for pending
/// durable writes.
pub struct SyncEngine {
    tab_id: TabId,
    collections: Collections,
    realtime: RealtimeChannel,
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
}

impl SyncEngine {
    /// Start building an engine.
    pub fn builder(config: EngineConfig) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            tab_id: None,
            store: None,
            broadcast: Arc::new(NoBroadcast),
            remote: None,
            realtime: None,
            seeder: None,
            collections: Vec::new(),
        }
    }

    /// This tab's id.
    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// Registered collection names.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Replica of `name`.
    pub fn replica(&self, name: &str) -> Option<&LocalReplica> {
        self.collections
            .get(name)
            .map(|managed| managed.coordinator.replica())
    }

    /// Sync coordinator of `name`.
    pub fn coordinator(&self, name: &str) -> Option<&ServerSyncCoordinator> {
        self.collections.get(name).map(|managed| &managed.coordinator)
    }

    /// Mutate `name` locally. See [`LocalReplica::apply`].
    pub fn apply<F, R>(&self, name: &str, mutation: F) -> Result<R>
    where
        F: FnOnce(&mut Vec<Entity>) -> R,
    {
        self.replica(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))?
            .apply(mutation)
    }

    /// Pull `name` from the server now.
    pub async fn refresh(&self, name: &str) -> Result<PullOutcome> {
        let managed = self
            .collections
            .get(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))?;
        if managed.policy != SyncPolicy::Server {
            return Err(Error::NotServerSynced(name.to_string()));
        }
        Ok(managed.coordinator.pull().await)
    }

    /// Pull every server-synced collection now.
    pub async fn refresh_all(&self) {
        pull_all(&self.collections).await;
    }

    /// Current realtime connection state.
    pub fn realtime_state(&self) -> ChannelState {
        self.realtime.state()
    }

    /// Subscribe to realtime connection state changes.
    pub fn watch_realtime(&self) -> watch::Receiver<ChannelState> {
        self.realtime.watch()
    }

    /// Stop background work and wait for queued durable writes.
    pub async fn shutdown(mut self) {
        self.subscriptions.clear();
        self.stop_tasks();
        for managed in self.collections.values() {
            managed.coordinator.replica().flush().await;
        }
        tracing::info!(tab_id = %self.tab_id, "Sync engine stopped");
    }

    fn stop_tasks(&mut self) {
        self.realtime.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("tab_id", &self.tab_id)
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .field("realtime", &self.realtime.state())
            .finish()
    }
}
