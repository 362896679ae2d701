//! LocalReplica - the in-memory, observable snapshot of one collection.
//!
//! All reads and mutations happen here. A successful mutation, in order:
//!
//! 1. swaps the in-memory snapshot (read-your-writes for the caller),
//! 2. queues an asynchronous durable write,
//! 3. notifies subscribers with [`ReplicaEvent::Changed`].
//!
//! Writes are performed by a single writer task per replica, so they reach the
//! [`DurableStore`] in mutation order. Once a write succeeds, subscribers get
//! [`ReplicaEvent::Persisted`] for that revision.

use crate::entity::validate_unique_ids;
use crate::{
    error::Result, CollectionName, DurableStore, Entity, Migrations, NamedCollection,
    SchemaVersion, StoredEntry,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

/// Monotonic per-replica change counter.
pub type Revision = u64;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    /// A mutation made by this tab
    Local,
    /// Initial data supplied by a seeder
    Seed,
    /// Reloaded from durable storage (startup or another tab's write)
    Rehydrate,
    /// Replaced by a server pull
    Pull,
}

/// Notification delivered to replica subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// The in-memory snapshot changed.
    Changed {
        origin: ChangeOrigin,
        revision: Revision,
    },
    /// The snapshot at `revision` reached durable storage.
    Persisted {
        origin: ChangeOrigin,
        revision: Revision,
    },
}

impl ReplicaEvent {
    /// Origin of the change this event reports.
    pub fn origin(&self) -> ChangeOrigin {
        match self {
            ReplicaEvent::Changed { origin, .. } | ReplicaEvent::Persisted { origin, .. } => {
                *origin
            }
        }
    }
}

type Listener = Arc<dyn Fn(&ReplicaEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    entries: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl Listeners {
    fn add(&self, listener: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        id
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|(entry_id, _)| *entry_id != id);
    }

    /// Call every listener. The lock is released first so a listener may
    /// subscribe or mutate the replica itself.
    fn notify(&self, event: &ReplicaEvent) {
        let listeners: Vec<Listener> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

/// Handle returned by [`LocalReplica::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    listeners: Weak<Listeners>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

enum WriteJob {
    Persist {
        entry: StoredEntry,
        origin: ChangeOrigin,
        revision: Revision,
    },
    Flush(oneshot::Sender<()>),
}

struct State {
    snapshot: NamedCollection,
    revision: Revision,
}

struct Inner {
    name: CollectionName,
    schema_version: SchemaVersion,
    state: Mutex<State>,
    listeners: Arc<Listeners>,
    store: Arc<dyn DurableStore>,
    migrations: Migrations,
    writer: mpsc::UnboundedSender<WriteJob>,
}

/// In-memory snapshot of one named collection.
///
/// Cheap to clone; clones share state. Must be created inside a tokio runtime
/// because it spawns its writer task.
#[derive(Clone)]
pub struct LocalReplica {
    inner: Arc<Inner>,
}

impl LocalReplica {
    /// Create an empty replica backed by `store`.
    pub fn new(
        name: impl Into<CollectionName>,
        schema_version: SchemaVersion,
        store: Arc<dyn DurableStore>,
        migrations: Migrations,
    ) -> Self {
        let name = name.into();
        let listeners = Arc::new(Listeners::default());
        let (writer, jobs) = mpsc::unbounded_channel();

        tokio::spawn(run_writer(
            name.clone(),
            store.clone(),
            listeners.clone(),
            jobs,
        ));

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    snapshot: NamedCollection::empty(name.clone(), schema_version),
                    revision: 0,
                }),
                name,
                schema_version,
                listeners,
                store,
                migrations,
                writer,
            }),
        }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schema version the running code expects.
    pub fn schema_version(&self) -> SchemaVersion {
        self.inner.schema_version
    }

    /// Clone of the current snapshot.
    pub fn snapshot(&self) -> NamedCollection {
        self.inner.state.lock().snapshot.clone()
    }

    /// Clone of the current items.
    pub fn items(&self) -> Vec<Entity> {
        self.inner.state.lock().snapshot.items.clone()
    }

    /// Get a single entity by id.
    pub fn get(&self, id: &str) -> Option<Entity> {
        self.inner.state.lock().snapshot.get(id).cloned()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.inner.state.lock().snapshot.len()
    }

    /// Check if the replica holds no entities.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current revision; bumps on every change.
    pub fn revision(&self) -> Revision {
        self.inner.state.lock().revision
    }

    /// Mutate the collection.
    ///
    /// The mutation runs on a working copy. If it leaves duplicate ids behind,
    /// the snapshot is not touched and nothing is persisted or announced.
    ///
    /// The replica is locked while `mutation` runs; it must not call back into
    /// the replica.
    pub fn apply<F, R>(&self, mutation: F) -> Result<R>
    where
        F: FnOnce(&mut Vec<Entity>) -> R,
    {
        let (_, output) = self.commit(ChangeOrigin::Local, mutation)?;
        Ok(output)
    }

    /// Replace every item at once (used by pull).
    pub fn replace(&self, items: Vec<Entity>, origin: ChangeOrigin) -> Result<Revision> {
        let (revision, ()) = self.commit(origin, move |current| *current = items)?;
        Ok(revision)
    }

    /// Install seed data.
    pub fn seed(&self, items: Vec<Entity>) -> Result<Revision> {
        self.replace(items, ChangeOrigin::Seed)
    }

    fn commit<F, R>(&self, origin: ChangeOrigin, mutation: F) -> Result<(Revision, R)>
    where
        F: FnOnce(&mut Vec<Entity>) -> R,
    {
        let (revision, output) = {
            let mut state = self.inner.state.lock();
            let mut items = state.snapshot.items.clone();
            let output = mutation(&mut items);
            validate_unique_ids(&self.inner.name, &items)?;

            state.snapshot.items = items;
            state.revision += 1;
            let revision = state.revision;

            // Queued under the lock so writes keep mutation order.
            self.queue_write(
                StoredEntry::for_collection(state.snapshot.clone()),
                origin,
                revision,
            );
            (revision, output)
        };

        self.inner
            .listeners
            .notify(&ReplicaEvent::Changed { origin, revision });
        Ok((revision, output))
    }

    fn queue_write(&self, entry: StoredEntry, origin: ChangeOrigin, revision: Revision) {
        let job = WriteJob::Persist {
            entry,
            origin,
            revision,
        };
        if self.inner.writer.send(job).is_err() {
            tracing::warn!(collection = %self.inner.name, "Writer task gone, change not persisted");
        }
    }

    /// Reload the snapshot from durable storage.
    ///
    /// An absent entry yields an empty collection. A stored entry from an
    /// older schema is migrated (and the migrated form written back). A read
    /// failure, or an entry that cannot be migrated, leaves the snapshot as it
    /// is and returns the error.
    pub async fn rehydrate(&self) -> Result<usize> {
        let stored = self.inner.store.read(&self.inner.name).await?;

        let (collection, migrated) = match stored {
            Some(entry) => {
                let mut payload = entry.payload;
                payload.name = self.inner.name.clone();
                payload.schema_version = entry.version;
                let migrated = entry.version != self.inner.schema_version;
                let payload = self
                    .inner
                    .migrations
                    .upgrade(payload, self.inner.schema_version)?;
                payload.validate_unique_ids()?;
                (payload, migrated)
            }
            None => (
                NamedCollection::empty(self.inner.name.clone(), self.inner.schema_version),
                false,
            ),
        };

        let count = collection.len();
        let revision = {
            let mut state = self.inner.state.lock();
            state.snapshot = collection;
            state.revision += 1;
            let revision = state.revision;
            if migrated {
                self.queue_write(
                    StoredEntry::for_collection(state.snapshot.clone()),
                    ChangeOrigin::Rehydrate,
                    revision,
                );
            }
            revision
        };

        tracing::debug!(collection = %self.inner.name, items = count, migrated, "Rehydrated from durable storage");
        self.inner.listeners.notify(&ReplicaEvent::Changed {
            origin: ChangeOrigin::Rehydrate,
            revision,
        });
        Ok(count)
    }

    /// Register a listener for change and persistence events.
    ///
    /// Listeners run synchronously on the thread that made the change (or on
    /// the writer task, for `Persisted`), so they must not block.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ReplicaEvent) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.add(Arc::new(listener));
        Subscription {
            listeners: Arc::downgrade(&self.inner.listeners),
            id,
        }
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.writer.send(WriteJob::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for LocalReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LocalReplica")
            .field("name", &self.inner.name)
            .field("schema_version", &self.inner.schema_version)
            .field("items", &state.snapshot.len())
            .field("revision", &state.revision)
            .finish()
    }
}

/// Drain write jobs in order until every replica handle is dropped.
async fn run_writer(
    name: CollectionName,
    store: Arc<dyn DurableStore>,
    listeners: Arc<Listeners>,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            WriteJob::Persist {
                entry,
                origin,
                revision,
            } => match store.write(entry).await {
                Ok(()) => {
                    tracing::trace!(collection = %name, revision, "Persisted snapshot");
                    listeners.notify(&ReplicaEvent::Persisted { origin, revision });
                }
                Err(e) => {
                    // The in-memory snapshot stays authoritative until the next write.
                    tracing::warn!(collection = %name, revision, error = %e, "Durable write failed");
                }
            },
            WriteJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, MemoryStore};
    use async_trait::async_trait;
    use serde_json::json;

    fn entity(value: serde_json::Value) -> Entity {
        Entity::new(value).unwrap()
    }

    fn replica(store: &MemoryStore) -> LocalReplica {
        LocalReplica::new("projects", 1, Arc::new(store.clone()), Migrations::new())
    }

    fn recorder(replica: &LocalReplica) -> (Arc<Mutex<Vec<ReplicaEvent>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let sub = replica.subscribe(move |event| sink.lock().push(*event));
        (events, sub)
    }

    #[tokio::test]
    async fn apply_is_visible_immediately() {
        let store = MemoryStore::new();
        let replica = replica(&store);

        replica
            .apply(|items| items.push(entity(json!({"id": "p1", "name": "X"}))))
            .unwrap();

        // Read-your-writes before any await.
        assert_eq!(replica.len(), 1);
        assert_eq!(replica.get("p1").unwrap().as_value()["name"], "X");
        assert_eq!(replica.revision(), 1);
    }

    #[tokio::test]
    async fn apply_persists_and_notifies_in_order() {
        let store = MemoryStore::new();
        let replica = replica(&store);
        let (events, _sub) = recorder(&replica);

        replica
            .apply(|items| items.push(entity(json!({"id": "p1"}))))
            .unwrap();
        replica
            .apply(|items| items.push(entity(json!({"id": "p2"}))))
            .unwrap();
        replica.flush().await;

        let stored = store.read("projects").await.unwrap().unwrap();
        assert_eq!(stored.payload.ids().collect::<Vec<_>>(), vec!["p1", "p2"]);

        let events = events.lock().clone();
        assert_eq!(
            events,
            vec![
                ReplicaEvent::Changed {
                    origin: ChangeOrigin::Local,
                    revision: 1
                },
                ReplicaEvent::Changed {
                    origin: ChangeOrigin::Local,
                    revision: 2
                },
                ReplicaEvent::Persisted {
                    origin: ChangeOrigin::Local,
                    revision: 1
                },
                ReplicaEvent::Persisted {
                    origin: ChangeOrigin::Local,
                    revision: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn apply_returns_mutation_output() {
        let replica = replica(&MemoryStore::new());
        let len = replica
            .apply(|items| {
                items.push(entity(json!({"id": "a"})));
                items.len()
            })
            .unwrap();
        assert_eq!(len, 1);
    }

    #[tokio::test]
    async fn duplicate_ids_leave_snapshot_untouched() {
        let store = MemoryStore::new();
        let replica = replica(&store);
        let (events, _sub) = recorder(&replica);

        replica
            .apply(|items| items.push(entity(json!({"id": "a", "v": 1}))))
            .unwrap();
        let err = replica
            .apply(|items| items.push(entity(json!({"id": "a", "v": 2}))))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId { .. }));

        assert_eq!(replica.len(), 1);
        assert_eq!(replica.revision(), 1);
        replica.flush().await;
        assert_eq!(events.lock().len(), 2); // one Changed, one Persisted
    }

    #[tokio::test]
    async fn rehydrate_reads_what_another_handle_wrote() {
        let store = MemoryStore::new();
        let tab_a = replica(&store);
        let tab_b = replica(&store);

        tab_a
            .apply(|items| items.push(entity(json!({"id": "p1", "name": "X"}))))
            .unwrap();
        tab_a.flush().await;
        assert!(tab_b.is_empty());

        let (events, _sub) = recorder(&tab_b);
        assert_eq!(tab_b.rehydrate().await.unwrap(), 1);
        assert_eq!(tab_b.get("p1").unwrap().as_value()["name"], "X");
        assert_eq!(
            events.lock().as_slice(),
            &[ReplicaEvent::Changed {
                origin: ChangeOrigin::Rehydrate,
                revision: 1
            }]
        );
    }

    #[tokio::test]
    async fn rehydrate_empty_store_yields_empty_collection() {
        let replica = replica(&MemoryStore::new());
        assert_eq!(replica.rehydrate().await.unwrap(), 0);
        assert!(replica.is_empty());
    }

    #[tokio::test]
    async fn rehydrate_migrates_and_writes_back() {
        let store = MemoryStore::new();
        store
            .write(StoredEntry::for_collection(
                NamedCollection::with_items(
                    "projects",
                    1,
                    vec![entity(json!({"id": "p1", "title": "Old"}))],
                )
                .unwrap(),
            ))
            .await
            .unwrap();

        let migrations = Migrations::new().step(1, |values| {
            values
                .into_iter()
                .map(|mut v| {
                    v["name"] = v["title"].take();
                    v
                })
                .collect()
        });
        let replica = LocalReplica::new("projects", 2, Arc::new(store.clone()), migrations);
        replica.rehydrate().await.unwrap();
        replica.flush().await;

        assert_eq!(replica.get("p1").unwrap().as_value()["name"], "Old");
        let stored = store.read("projects").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.payload.schema_version, 2);
    }

    #[tokio::test]
    async fn rehydrate_newer_version_keeps_snapshot() {
        let store = MemoryStore::new();
        store
            .write(StoredEntry::for_collection(
                NamedCollection::with_items("projects", 9, vec![entity(json!({"id": "p1"}))])
                    .unwrap(),
            ))
            .await
            .unwrap();

        let replica = replica(&store);
        let err = replica.rehydrate().await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { stored: 9, .. }));
        assert!(replica.is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl DurableStore for BrokenStore {
        async fn read(&self, _key: &str) -> Result<Option<StoredEntry>> {
            Err(Error::Storage("quota exceeded".into()))
        }

        async fn write(&self, _entry: StoredEntry) -> Result<()> {
            Err(Error::Storage("quota exceeded".into()))
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_failure_keeps_memory_authoritative() {
        let replica = LocalReplica::new("projects", 1, Arc::new(BrokenStore), Migrations::new());
        let (events, _sub) = recorder(&replica);

        replica
            .apply(|items| items.push(entity(json!({"id": "p1"}))))
            .unwrap();
        replica.flush().await;

        assert_eq!(replica.len(), 1);
        // Changed but never Persisted.
        assert_eq!(events.lock().len(), 1);
        assert!(replica.rehydrate().await.is_err());
        assert_eq!(replica.len(), 1);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let replica = replica(&MemoryStore::new());
        let (events, sub) = recorder(&replica);
        drop(sub);

        replica
            .apply(|items| items.push(entity(json!({"id": "p1"}))))
            .unwrap();
        replica.flush().await;
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn listener_may_read_replica() {
        let replica = replica(&MemoryStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (reader, sink) = (replica.clone(), seen.clone());
        let _sub = replica.subscribe(move |event| {
            if let ReplicaEvent::Changed { .. } = event {
                sink.lock().push(reader.len());
            }
        });

        replica
            .apply(|items| items.push(entity(json!({"id": "p1"}))))
            .unwrap();
        assert_eq!(seen.lock().as_slice(), &[1]);
    }
}
