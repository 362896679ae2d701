//! ServerSyncCoordinator - debounced push and merge-on-pull for one collection.
//!
//! # Push
//!
//! Every local change (re)schedules a push timer. The timer captures the
//! current generation; when it fires it sends the full snapshot *as of fire
//! time*, unless a pull is in flight or the generation has moved on. Any
//! number of changes inside one debounce window therefore produce at most one
//! request.
//!
//! ```text
//! Idle --change--> Scheduled{gen} --elapsed--> Firing --done--> Idle
//!                      |   ^                     |
//!                      |   +------change---------+
//!                      +--stale gen / pull in flight--> Idle
//! ```
//!
//! # Pull
//!
//! A pull bumps the generation before its first request, which invalidates
//! every timer scheduled earlier without touching it. The merge keeps
//! local-only documents in order, followed by every document the server
//! returned. The server wins any id present on both sides.

use crate::replica::{ChangeOrigin, ReplicaEvent, Subscription};
use crate::{error::Result, Entity, LocalReplica, RemoteApi};
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Monotonic counter used to invalidate scheduled pushes.
pub type Generation = u64;

/// Default debounce window.
pub const DEFAULT_PUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Maximum concurrent document fetches during a pull.
const FETCH_CONCURRENCY: usize = 8;

/// Push timer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushPhase {
    /// No push pending
    #[default]
    Idle,
    /// A timer is waiting; it will only send if `generation` is still current
    Scheduled { generation: Generation },
    /// A push request is in flight
    Firing,
}

/// Per-collection synchronization state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Push timer phase
    pub push: PushPhase,
    /// Bumped at the start of every pull
    pub generation: Generation,
    /// Number of pulls currently running
    pub pulls_in_flight: u32,
    /// Set while another tab's write is being rehydrated
    pub applying_external: bool,
}

impl SyncState {
    /// Check if at least one pull is running.
    pub fn is_pull_in_flight(&self) -> bool {
        self.pulls_in_flight > 0
    }
}

/// Result of a [`ServerSyncCoordinator::pull`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The merged snapshot replaced the local one.
    Applied {
        /// Local-only documents preserved
        kept_local: usize,
        /// Documents taken from the server
        from_server: usize,
    },
    /// The pull failed; the local snapshot is untouched.
    Failed,
}

/// Output of [`merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct Merged {
    pub items: Vec<Entity>,
    pub kept_local: usize,
    pub from_server: usize,
}

/// Merge local and remote documents: local-only first, then the server's.
///
/// A remote id appearing twice keeps its first occurrence.
pub fn merge(local: Vec<Entity>, remote: Vec<Entity>) -> Merged {
    let mut remote_ids = HashSet::with_capacity(remote.len());
    let remote: Vec<Entity> = remote
        .into_iter()
        .filter(|e| remote_ids.insert(e.id().to_string()))
        .collect();

    let mut items: Vec<Entity> = local
        .into_iter()
        .filter(|e| !remote_ids.contains(e.id()))
        .collect();
    let kept_local = items.len();
    let from_server = remote.len();
    items.extend(remote);

    Merged {
        items,
        kept_local,
        from_server,
    }
}

struct PendingTimer {
    ticket: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    state: SyncState,
    timer: Option<PendingTimer>,
    next_ticket: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Serializes push requests so an older snapshot never lands last.
    push_lock: tokio::sync::Mutex<()>,
    pushes_sent: AtomicU64,
}

/// Keeps `pulls_in_flight` raised until dropped, even if the pull future is
/// cancelled mid-request.
struct PullInFlight {
    shared: Arc<Shared>,
}

impl PullInFlight {
    fn enter(shared: &Arc<Shared>) -> (Self, Generation) {
        let mut inner = shared.inner.lock();
        inner.state.pulls_in_flight += 1;
        inner.state.generation += 1;
        let generation = inner.state.generation;
        drop(inner);
        (
            Self {
                shared: shared.clone(),
            },
            generation,
        )
    }
}

impl Drop for PullInFlight {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.state.pulls_in_flight = inner.state.pulls_in_flight.saturating_sub(1);
    }
}

/// Clears `applying_external` on every exit path.
struct ApplyingExternal {
    shared: Arc<Shared>,
}

impl ApplyingExternal {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.inner.lock().state.applying_external = true;
        Self {
            shared: shared.clone(),
        }
    }
}

impl Drop for ApplyingExternal {
    fn drop(&mut self) {
        self.shared.inner.lock().state.applying_external = false;
    }
}

/// Owns push and pull for one server-synced collection.
#[derive(Clone)]
pub struct ServerSyncCoordinator {
    replica: LocalReplica,
    remote: Arc<dyn RemoteApi>,
    debounce: Duration,
    runtime: Handle,
    shared: Arc<Shared>,
}

impl ServerSyncCoordinator {
    /// Create a coordinator. Must be called inside a tokio runtime; timers are
    /// spawned on it even when changes come from other threads.
    pub fn new(replica: LocalReplica, remote: Arc<dyn RemoteApi>, debounce: Duration) -> Self {
        Self {
            replica,
            remote,
            debounce,
            runtime: Handle::current(),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                push_lock: tokio::sync::Mutex::new(()),
                pushes_sent: AtomicU64::new(0),
            }),
        }
    }

    /// The replica this coordinator syncs.
    pub fn replica(&self) -> &LocalReplica {
        &self.replica
    }

    /// Copy of the current sync state.
    pub fn state(&self) -> SyncState {
        self.shared.inner.lock().state.clone()
    }

    /// Number of push requests that reached the server successfully.
    pub fn push_count(&self) -> u64 {
        self.shared.pushes_sent.load(Ordering::Relaxed)
    }

    /// Schedule pushes for every local change of the replica.
    pub fn watch_local_changes(&self) -> Subscription {
        let this = self.clone();
        self.replica.subscribe(move |event| {
            if let ReplicaEvent::Changed {
                origin: ChangeOrigin::Local,
                ..
            } = event
            {
                this.schedule_push();
            }
        })
    }

    /// Restart the debounce timer.
    pub fn schedule_push(&self) {
        let mut inner = self.shared.inner.lock();
        let generation = inner.state.generation;
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;

        // Measured from the change, not from when the task first runs.
        let deadline = tokio::time::Instant::now() + self.debounce;
        let this = self.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            this.fire(ticket, generation).await;
        });

        if let Some(previous) = inner.timer.replace(PendingTimer { ticket, handle }) {
            previous.handle.abort();
        }
        inner.state.push = PushPhase::Scheduled { generation };
    }

    async fn fire(&self, ticket: u64, generation: Generation) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.timer.as_ref().map(|timer| timer.ticket) != Some(ticket) {
                // Superseded by a newer timer.
                return;
            }
            inner.timer = None;
        }

        let _in_flight = self.shared.push_lock.lock().await;
        let collection = self.replica.name();

        {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_pull_in_flight() || inner.state.generation != generation {
                tracing::trace!(
                    collection,
                    generation,
                    current = inner.state.generation,
                    "Dropping stale push"
                );
                if inner.timer.is_none() {
                    inner.state.push = PushPhase::Idle;
                }
                return;
            }
            if inner.timer.is_none() {
                inner.state.push = PushPhase::Firing;
            }
        }

        let items = self.replica.items();
        match self.remote.push_all(collection, &items).await {
            Ok(()) => {
                self.shared.pushes_sent.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(collection, items = items.len(), "Pushed snapshot");
            }
            Err(e) => tracing::warn!(collection, error = %e, "Push failed"),
        }

        let mut inner = self.shared.inner.lock();
        if inner.state.push == PushPhase::Firing {
            inner.state.push = PushPhase::Idle;
        }
    }

    /// Download the server's snapshot, merge it, and replace local state.
    ///
    /// Failures are logged and leave the replica untouched; there is no retry.
    pub async fn pull(&self) -> PullOutcome {
        let (_in_flight, generation) = PullInFlight::enter(&self.shared);
        let collection = self.replica.name();
        tracing::debug!(collection, generation, "Pull started");

        let outcome = match self.fetch_remote().await {
            Ok(remote) => {
                let merged = merge(self.replica.items(), remote);
                match self.replica.replace(merged.items, ChangeOrigin::Pull) {
                    Ok(_) => {
                        self.replica.flush().await;
                        tracing::info!(
                            collection,
                            kept_local = merged.kept_local,
                            from_server = merged.from_server,
                            "Pulled from server"
                        );
                        PullOutcome::Applied {
                            kept_local: merged.kept_local,
                            from_server: merged.from_server,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(collection, error = %e, "Merged snapshot rejected");
                        PullOutcome::Failed
                    }
                }
            }
            Err(e) => {
                tracing::warn!(collection, error = %e, "Pull failed");
                PullOutcome::Failed
            }
        };

        outcome
    }

    async fn fetch_remote(&self) -> Result<Vec<Entity>> {
        let collection = self.replica.name();
        let summaries = self.remote.list(collection).await?;
        let ids: Vec<String> = summaries
            .iter()
            .filter_map(|summary| summary.get("id").and_then(Value::as_str))
            .map(str::to_owned)
            .collect();

        let remote = self.remote.clone();
        let documents: Vec<Option<Value>> = futures::stream::iter(ids)
            .map(|id| {
                let remote = remote.clone();
                async move { remote.fetch(collection, &id).await }
            })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(documents
            .into_iter()
            .flatten()
            .filter_map(|document| match Entity::new(document) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    tracing::debug!(collection, error = %e, "Skipping remote document");
                    None
                }
            })
            .collect())
    }

    /// Reload the replica from durable storage on behalf of another tab.
    ///
    /// `applying_external` stays set for the duration. The resulting change
    /// carries [`ChangeOrigin::Rehydrate`], which is never announced back, so
    /// local edits made meanwhile are still announced.
    pub async fn apply_external_update(&self) -> Result<usize> {
        let _applying = ApplyingExternal::enter(&self.shared);
        self.replica.rehydrate().await
    }

    /// Check if an external update is being applied.
    pub fn is_applying_external(&self) -> bool {
        self.shared.inner.lock().state.applying_external
    }
}

impl std::fmt::Debug for ServerSyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSyncCoordinator")
            .field("collection", &self.replica.name())
            .field("debounce", &self.debounce)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Migrations, MemoryStore};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::sync::Notify;
    use tokio::time::{advance, Instant};

    fn entity(value: Value) -> Entity {
        Entity::new(value).unwrap()
    }

    #[derive(Default)]
    struct FakeRemote {
        documents: Mutex<Vec<Value>>,
        pushes: Mutex<Vec<(Instant, Vec<Value>)>>,
        fail: Mutex<bool>,
        gate: Mutex<Option<Arc<Notify>>>,
    }

    #[async_trait]
    impl RemoteApi for FakeRemote {
        async fn list(&self, _collection: &str) -> Result<Vec<Value>> {
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if *self.fail.lock() {
                return Err(Error::Http { status: 503 });
            }
            Ok(self
                .documents
                .lock()
                .iter()
                .map(|d| json!({"id": d["id"]}))
                .collect())
        }

        async fn fetch(&self, _collection: &str, id: &str) -> Result<Option<Value>> {
            Ok(self
                .documents
                .lock()
                .iter()
                .find(|d| d["id"] == id)
                .cloned())
        }

        async fn push_all(&self, _collection: &str, items: &[Entity]) -> Result<()> {
            let items = items.iter().map(|e| e.as_value().clone()).collect();
            self.pushes.lock().push((Instant::now(), items));
            Ok(())
        }
    }

    fn setup(remote: &Arc<FakeRemote>) -> (ServerSyncCoordinator, Subscription) {
        let replica = LocalReplica::new(
            "projects",
            1,
            Arc::new(MemoryStore::new()),
            Migrations::new(),
        );
        let coordinator = ServerSyncCoordinator::new(replica, remote.clone(), DEFAULT_PUSH_DEBOUNCE);
        let sub = coordinator.watch_local_changes();
        (coordinator, sub)
    }

    fn add(coordinator: &ServerSyncCoordinator, value: Value) {
        coordinator
            .replica()
            .apply(|items| items.push(entity(value)))
            .unwrap();
    }

    #[test]
    fn merge_law() {
        let local = vec![
            entity(json!({"id": "a", "v": 1})),
            entity(json!({"id": "b", "v": 2})),
        ];
        let remote = vec![entity(json!({"id": "a", "v": 9}))];

        let merged = merge(local, remote);
        assert_eq!(
            merged
                .items
                .iter()
                .map(|e| e.as_value().clone())
                .collect::<Vec<_>>(),
            vec![json!({"id": "b", "v": 2}), json!({"id": "a", "v": 9})]
        );
        assert_eq!(merged.kept_local, 1);
        assert_eq!(merged.from_server, 1);
    }

    #[test]
    fn merge_drops_duplicate_remote_ids() {
        let remote = vec![
            entity(json!({"id": "a", "v": 1})),
            entity(json!({"id": "a", "v": 2})),
        ];
        let merged = merge(Vec::new(), remote);
        assert_eq!(merged.items.len(), 1);
        assert_eq!(merged.items[0].as_value()["v"], 1);
    }

    proptest! {
        #[test]
        fn merge_preserves_local_only_and_takes_every_remote(
            local_ids in proptest::collection::hash_set("[a-f]", 0..6),
            remote_ids in proptest::collection::hash_set("[a-f]", 0..6),
        ) {
            let local: Vec<Entity> = local_ids
                .iter()
                .map(|id| entity(json!({"id": id, "side": "local"})))
                .collect();
            let remote: Vec<Entity> = remote_ids
                .iter()
                .map(|id| entity(json!({"id": id, "side": "remote"})))
                .collect();

            let merged = merge(local.clone(), remote.clone());

            // Unique ids.
            let ids: HashSet<&str> = merged.items.iter().map(Entity::id).collect();
            prop_assert_eq!(ids.len(), merged.items.len());

            // Local-only prefix, in local order.
            let expected_local: Vec<&Entity> = local
                .iter()
                .filter(|e| !remote_ids.contains(e.id()))
                .collect();
            prop_assert_eq!(merged.kept_local, expected_local.len());
            for (got, want) in merged.items.iter().zip(expected_local) {
                prop_assert_eq!(got, want);
            }

            // Remote suffix, verbatim.
            prop_assert_eq!(&merged.items[merged.kept_local..], remote.as_slice());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_in_one_window_coalesce() {
        let remote = Arc::new(FakeRemote::default());
        let (coordinator, _sub) = setup(&remote);
        let start = Instant::now();

        add(&coordinator, json!({"id": "a"}));
        advance(Duration::from_millis(200)).await;
        add(&coordinator, json!({"id": "b"}));
        advance(Duration::from_millis(200)).await;
        add(&coordinator, json!({"id": "c"}));
        assert!(matches!(
            coordinator.state().push,
            PushPhase::Scheduled { generation: 0 }
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;

        let pushes = remote.pushes.lock();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0 - start, Duration::from_millis(900));
        assert_eq!(
            pushes[0].1,
            vec![json!({"id": "a"}), json!({"id": "b"}), json!({"id": "c"})]
        );
        assert_eq!(coordinator.push_count(), 1);
        assert_eq!(coordinator.state().push, PushPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn push_sends_state_at_fire_time() {
        let remote = Arc::new(FakeRemote::default());
        let (coordinator, _sub) = setup(&remote);

        add(&coordinator, json!({"id": "a"}));
        // Mutations that bypass the listener still show up in the push.
        let _ = coordinator.replica().replace(
            vec![entity(json!({"id": "a"})), entity(json!({"id": "z"}))],
            ChangeOrigin::Pull,
        );
        tokio::time::sleep(Duration::from_secs(1)).await;

        let pushes = remote.pushes.lock();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1, vec![json!({"id": "a"}), json!({"id": "z"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_completed_before_timer_fires_cancels_push() {
        let remote = Arc::new(FakeRemote::default());
        remote.documents.lock().push(json!({"id": "s1", "from": "server"}));
        let (coordinator, _sub) = setup(&remote);

        add(&coordinator, json!({"id": "a"}));
        assert_eq!(
            coordinator.pull().await,
            PullOutcome::Applied {
                kept_local: 1,
                from_server: 1
            }
        );
        assert_eq!(coordinator.state().generation, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(remote.pushes.lock().is_empty());
        assert_eq!(coordinator.state().push, PushPhase::Idle);
        assert_eq!(coordinator.replica().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_firing_during_pull_is_dropped() {
        let remote = Arc::new(FakeRemote::default());
        let gate = Arc::new(Notify::new());
        *remote.gate.lock() = Some(gate.clone());
        let (coordinator, _sub) = setup(&remote);

        add(&coordinator, json!({"id": "a"}));
        let pulling = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.pull().await })
        };
        tokio::task::yield_now().await;
        assert!(coordinator.state().is_pull_in_flight());

        // Timer elapses while the pull is blocked.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(remote.pushes.lock().is_empty());

        gate.notify_one();
        assert!(matches!(
            pulling.await.unwrap(),
            PullOutcome::Applied { .. }
        ));
        assert!(!coordinator.state().is_pull_in_flight());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(remote.pushes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn change_after_pull_pushes_again() {
        let remote = Arc::new(FakeRemote::default());
        let (coordinator, _sub) = setup(&remote);

        add(&coordinator, json!({"id": "a"}));
        coordinator.pull().await;
        add(&coordinator, json!({"id": "b"}));
        assert!(matches!(
            coordinator.state().push,
            PushPhase::Scheduled { generation: 1 }
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let pushes = remote.pushes.lock();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1, vec![json!({"id": "a"}), json!({"id": "b"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pull_leaves_replica_untouched() {
        let remote = Arc::new(FakeRemote::default());
        remote.documents.lock().push(json!({"id": "a", "v": 9}));
        *remote.fail.lock() = true;
        let (coordinator, _sub) = setup(&remote);
        add(&coordinator, json!({"id": "a", "v": 1}));
        let revision = coordinator.replica().revision();

        assert_eq!(coordinator.pull().await, PullOutcome::Failed);
        assert_eq!(coordinator.replica().revision(), revision);
        assert_eq!(coordinator.replica().get("a").unwrap().as_value()["v"], 1);
        assert!(!coordinator.state().is_pull_in_flight());
        // The pull still invalidated the pending timer.
        assert_eq!(coordinator.state().generation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_skips_documents_gone_since_listing() {
        struct Vanishing;

        #[async_trait]
        impl RemoteApi for Vanishing {
            async fn list(&self, _collection: &str) -> Result<Vec<Value>> {
                Ok(vec![json!({"id": "kept"}), json!({"id": "gone"}), json!({"name": "no id"})])
            }

            async fn fetch(&self, _collection: &str, id: &str) -> Result<Option<Value>> {
                Ok((id == "kept").then(|| json!({"id": "kept", "full": true})))
            }

            async fn push_all(&self, _collection: &str, _items: &[Entity]) -> Result<()> {
                Ok(())
            }
        }

        let replica = LocalReplica::new("projects", 1, Arc::new(MemoryStore::new()), Migrations::new());
        let coordinator = ServerSyncCoordinator::new(replica, Arc::new(Vanishing), DEFAULT_PUSH_DEBOUNCE);

        assert_eq!(
            coordinator.pull().await,
            PullOutcome::Applied {
                kept_local: 0,
                from_server: 1
            }
        );
        assert_eq!(
            coordinator.replica().get("kept").unwrap().as_value(),
            &json!({"id": "kept", "full": true})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pull_does_not_block_pushes() {
        let remote = Arc::new(FakeRemote::default());
        // Never notified: the listing hangs.
        *remote.gate.lock() = Some(Arc::new(Notify::new()));
        let (coordinator, _sub) = setup(&remote);

        let timed_out = tokio::time::timeout(Duration::from_secs(5), coordinator.pull()).await;
        assert!(timed_out.is_err());
        assert!(!coordinator.state().is_pull_in_flight());

        add(&coordinator, json!({"id": "a"}));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(remote.pushes.lock().len(), 1);
        assert_eq!(coordinator.push_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_pull_task_releases_in_flight() {
        let remote = Arc::new(FakeRemote::default());
        *remote.gate.lock() = Some(Arc::new(Notify::new()));
        let (coordinator, _sub) = setup(&remote);

        let pulling = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.pull().await })
        };
        tokio::task::yield_now().await;
        assert!(coordinator.state().is_pull_in_flight());

        pulling.abort();
        assert!(pulling.await.unwrap_err().is_cancelled());
        assert_eq!(coordinator.state().pulls_in_flight, 0);
    }

    #[tokio::test]
    async fn external_update_flag_is_scoped() {
        let remote = Arc::new(FakeRemote::default());
        let (coordinator, _sub) = setup(&remote);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let (probe, sink) = (coordinator.clone(), observed.clone());
        let _watch = coordinator.replica().subscribe(move |event| {
            if let ReplicaEvent::Changed { .. } = event {
                sink.lock().push(probe.is_applying_external());
            }
        });

        coordinator.apply_external_update().await.unwrap();
        assert_eq!(observed.lock().as_slice(), &[true]);
        assert!(!coordinator.is_applying_external());
    }
}
