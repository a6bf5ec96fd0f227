//! Sync engine runtime.
//!
//! [`SyncEngine`] owns the [`Replica`] behind a single `RwLock` and runs the
//! background tasks that talk to the [`RemoteGateway`]:
//!
//! - the push worker dispatches ready operations, one tracked task per
//!   push, and sleeps until the next backoff expiry, a new write, or a
//!   connectivity-restored signal
//! - one subscription worker per collection applies remote changes and
//!   resubscribes from the persisted cursor when the stream ends; a denied
//!   subscription parks the worker until the next foreground refresh
//! - the persister writes the snapshot file whenever state changed
//! - the session watcher shuts everything down on sign-out
//!
//! Every mutation happens inside one write section of the lock, and its
//! changes are published to the [`ChangeFeed`] before the lock is released,
//! so observers see changes in apply order. The lock is never held across
//! an await on the network.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::feed::{ChangeFeed, Observer};
use crate::gateway::{GatewayError, RemoteGateway};
use crate::session::Session;
use crate::storage::{FileStorage, Loaded};
use futures::StreamExt;
use laguna_engine::{
    CollectionName, CorruptEntry, FailedOperation, Fields, LocalWrite, PendingOperation,
    PushOutcome, Query, Record, RecordChange, RecordKey, RemoteApply, RemoteChange, Replica,
    Schema, Timestamp, WriteResult,
};
use rand::Rng;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

const FAILURE_CAPACITY: usize = 64;

/// Millisecond wall clock that follows tokio's (pausable) time source.
#[derive(Debug, Clone, Copy)]
struct Clock {
    epoch_ms: Timestamp,
    started: Instant,
}

impl Clock {
    fn new() -> Self {
        let epoch_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        Self {
            epoch_ms,
            started: Instant::now(),
        }
    }

    fn now(&self) -> Timestamp {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.epoch_ms.saturating_add(elapsed)
    }

    fn instant_at(&self, at: Timestamp) -> Instant {
        self.started + Duration::from_millis(at.saturating_sub(self.epoch_ms))
    }
}

/// What was found on disk when the engine started.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    /// Whether a previous snapshot was restored
    pub restored: bool,
    /// Records that could not be decoded; reads of them fail
    pub corrupt_records: Vec<CorruptEntry>,
    /// Where an unreadable or unrestorable state file was moved
    pub quarantined: Option<PathBuf>,
    /// Why the state file was moved aside
    pub quarantine_reason: Option<String>,
    /// Operations waiting to be pushed
    pub pending_operations: usize,
}

/// Records of one collection, with the slots that could not be decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    /// Intact active records in key order
    pub records: Vec<Record>,
    /// Corrupt slots; reads of these keys fail
    pub corrupt: Vec<CorruptEntry>,
}

/// Subscriptions stopped by a non-retryable gateway error, by collection.
pub type StoppedSubscriptions = BTreeMap<CollectionName, GatewayError>;

struct Inner {
    replica: RwLock<Replica>,
    gateway: Arc<dyn RemoteGateway>,
    feed: Arc<ChangeFeed>,
    storage: FileStorage,
    persist_lock: tokio::sync::Mutex<()>,
    failures: broadcast::Sender<FailedOperation>,
    push_wakeup: Notify,
    dirty: Notify,
    shutdown: watch::Sender<bool>,
    refresh: watch::Sender<u64>,
    reconnect: watch::Sender<u64>,
    stopped: watch::Sender<StoppedSubscriptions>,
    session: Session,
    collections: Vec<CollectionName>,
    clock: Clock,
    report: StartupReport,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Offline-first sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("session", &self.inner.session)
            .field("collections", &self.inner.collections)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncEngine {
    /// Load persisted state and start the background tasks.
    pub async fn start(
        config: &SyncConfig,
        schema: Schema,
        session: Session,
        gateway: Arc<dyn RemoteGateway>,
    ) -> Result<Self> {
        if !session.is_active() {
            return Err(SyncError::SessionClosed);
        }

        let storage = FileStorage::open(&config.data_dir).await?;
        let mut report = StartupReport::default();

        let replica = match storage.load().await? {
            Loaded::Restored(snapshot) => {
                if snapshot.node_id != session.node_id() {
                    tracing::warn!(
                        persisted = %snapshot.node_id,
                        session = %session.node_id(),
                        "Persisted state belongs to another node ID; keeping it"
                    );
                }
                match Replica::from_snapshot(schema.clone(), snapshot) {
                    Ok(replica) => {
                        report.restored = true;
                        replica
                    }
                    Err(err) => {
                        let reason = err.to_string();
                        report.quarantined = Some(storage.quarantine(&reason).await?);
                        report.quarantine_reason = Some(reason);
                        Replica::new(schema, session.node_id())
                    }
                }
            }
            Loaded::Quarantined { path, reason } => {
                report.quarantined = Some(path);
                report.quarantine_reason = Some(reason);
                Replica::new(schema, session.node_id())
            }
            Loaded::Empty => Replica::new(schema, session.node_id()),
        }
        .with_retry_policy(config.backoff, config.max_retries);

        report.corrupt_records = replica.store().corrupted().cloned().collect();
        report.pending_operations = replica.pending_count();
        for entry in &report.corrupt_records {
            tracing::error!(
                collection = %entry.collection,
                key = %entry.key,
                reason = %entry.reason,
                "Corrupt record in persisted state"
            );
        }

        let collections = config
            .collections
            .clone()
            .unwrap_or_else(|| replica.schema().collection_names());

        tracing::info!(
            node_id = %replica.node_id(),
            records = replica.store().slot_count(),
            pending = report.pending_operations,
            deferred = replica.deferred_count(),
            restored = report.restored,
            "Sync engine starting"
        );

        let (failures, _) = broadcast::channel(FAILURE_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let (refresh, _) = watch::channel(0);
        let (reconnect, _) = watch::channel(0);
        let (stopped, _) = watch::channel(StoppedSubscriptions::new());

        let engine = Self {
            inner: Arc::new(Inner {
                replica: RwLock::new(replica),
                gateway,
                feed: ChangeFeed::new_shared(),
                storage,
                persist_lock: tokio::sync::Mutex::new(()),
                failures,
                push_wakeup: Notify::new(),
                dirty: Notify::new(),
                shutdown,
                refresh,
                reconnect,
                stopped,
                session,
                collections,
                clock: Clock::new(),
                report,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        engine.spawn_tasks();
        Ok(engine)
    }

    // Receivers are taken here, before any task runs, so a shutdown or
    // refresh signalled right after start is never missed.
    fn spawn_tasks(&self) {
        let inner = &self.inner;
        let mut handles = vec![
            tokio::spawn(push_loop(inner.clone(), inner.shutdown.subscribe())),
            tokio::spawn(persist_loop(inner.clone(), inner.shutdown.subscribe())),
            tokio::spawn(session_watch(inner.clone(), inner.shutdown.subscribe())),
        ];
        for collection in &inner.collections {
            let signals = Signals {
                shutdown: inner.shutdown.subscribe(),
                refresh: inner.refresh.subscribe(),
                reconnect: inner.reconnect.subscribe(),
            };
            handles.push(tokio::spawn(subscription_loop(
                inner.clone(),
                collection.clone(),
                signals,
            )));
        }
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
    }

    // ---------------------------------------------------------------------
    // Write API
    // ---------------------------------------------------------------------

    /// Create a record. Fails if an active record already uses the key.
    pub async fn create(&self, collection: &str, key: &str, fields: Fields) -> Result<WriteResult> {
        self.write(collection, key, LocalWrite::Create(fields)).await
    }

    /// Create a record under a new random key.
    pub async fn create_with_generated_key(
        &self,
        collection: &str,
        fields: Fields,
    ) -> Result<(RecordKey, WriteResult)> {
        let key = uuid::Uuid::new_v4().to_string();
        let result = self.create(collection, &key, fields).await?;
        Ok((key, result))
    }

    /// Replace the fields of an existing record.
    pub async fn update(&self, collection: &str, key: &str, fields: Fields) -> Result<WriteResult> {
        self.write(collection, key, LocalWrite::Update(fields)).await
    }

    /// Create or replace a record.
    pub async fn put(&self, collection: &str, key: &str, fields: Fields) -> Result<WriteResult> {
        self.write(collection, key, LocalWrite::Put(fields)).await
    }

    /// Delete a record.
    pub async fn delete(&self, collection: &str, key: &str) -> Result<WriteResult> {
        self.write(collection, key, LocalWrite::Delete).await
    }

    /// Apply a local write optimistically and queue it for push.
    pub async fn write(&self, collection: &str, key: &str, write: LocalWrite) -> Result<WriteResult> {
        if !self.is_running() {
            return Err(SyncError::ShutDown);
        }
        if !self.inner.session.is_active() {
            return Err(SyncError::SessionClosed);
        }

        let now = self.inner.clock.now();
        let result = {
            let mut replica = self.inner.replica.write().await;
            let result = replica.write(collection, key, write, now)?;
            self.inner.feed.publish(&result.changes);
            result
        };

        tracing::debug!(
            collection = %collection,
            key = %key,
            local_revision = result.local_revision,
            op_id = ?result.op_id,
            "Local write applied"
        );

        self.inner.dirty.notify_one();
        self.inner.push_wakeup.notify_one();
        Ok(result)
    }

    // ---------------------------------------------------------------------
    // Read API
    // ---------------------------------------------------------------------

    /// Get an active record.
    pub async fn get(&self, collection: &str, key: &str) -> Result<Option<Record>> {
        let replica = self.inner.replica.read().await;
        Ok(replica.get(collection, key)?.cloned())
    }

    /// Run a query against a collection.
    ///
    /// ```ignore
    /// let newest = engine
    ///     .query("figuras", |q| {
    ///         q.order_by("fechaCreacion", Direction::Descending).limit(10).all().map(|r| r.len())
    ///     })
    ///     .await?;
    /// ```
    pub async fn query<F, T>(&self, collection: &str, f: F) -> T
    where
        F: FnOnce(Query<'_>) -> T,
    {
        let replica = self.inner.replica.read().await;
        f(replica.query(collection))
    }

    /// All active records of a collection in key order.
    ///
    /// Corrupt slots do not hide the rest of the collection; they are
    /// returned alongside the intact records.
    pub async fn list(&self, collection: &str) -> Listing {
        let replica = self.inner.replica.read().await;
        let (records, corrupt) = replica.query(collection).partition();
        Listing {
            records: records.into_iter().cloned().collect(),
            corrupt: corrupt.into_iter().cloned().collect(),
        }
    }

    /// Read anything from the replica.
    pub async fn read<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&Replica) -> T,
    {
        let replica = self.inner.replica.read().await;
        f(&replica)
    }

    /// Pending operation for a key.
    pub async fn pending(&self, collection: &str, key: &str) -> Option<PendingOperation> {
        self.inner
            .replica
            .read()
            .await
            .pending(collection, key)
            .cloned()
    }

    /// Number of operations waiting for confirmation.
    pub async fn pending_count(&self) -> usize {
        self.inner.replica.read().await.pending_count()
    }

    // ---------------------------------------------------------------------
    // Change feed
    // ---------------------------------------------------------------------

    /// Observe applied changes matching `predicate`.
    pub fn observe<F>(&self, predicate: F) -> Observer
    where
        F: Fn(&RecordChange) -> bool + Send + Sync + 'static,
    {
        self.inner.feed.observe(predicate)
    }

    /// Observe every change to one collection.
    pub fn observe_collection(&self, collection: impl Into<CollectionName>) -> Observer {
        let collection = collection.into();
        self.observe(move |change| change.collection == collection)
    }

    /// Observe changes matching `predicate`, starting with the current
    /// matching records as snapshot changes.
    pub async fn observe_with_snapshot<F>(&self, predicate: F) -> Observer
    where
        F: Fn(&RecordChange) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let filter = predicate.clone();

        // Registering under the write lock keeps the snapshot and the first
        // live change from overlapping or leaving a gap.
        let mut replica = self.inner.replica.write().await;
        let observer = self.inner.feed.observe(move |change| filter(change));
        let snapshot: Vec<RecordChange> = replica
            .snapshot_changes(|_| true)
            .into_iter()
            .filter(|change| predicate(change))
            .collect();
        observer.prime(snapshot);
        observer
    }

    /// Terminal push failures. Lagging receivers miss the oldest entries.
    pub fn failures(&self) -> broadcast::Receiver<FailedOperation> {
        self.inner.failures.subscribe()
    }

    /// Subscriptions the gateway refused for good.
    ///
    /// A stopped collection receives no remote changes until
    /// [`foreground_refresh`](Self::foreground_refresh) retries it.
    pub fn stopped_subscriptions(&self) -> watch::Receiver<StoppedSubscriptions> {
        self.inner.stopped.subscribe()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Retry every queued operation now and reconnect dropped subscriptions.
    pub async fn connectivity_restored(&self) {
        let now = self.inner.clock.now();
        let rescheduled = self.inner.replica.write().await.retry_now(now);
        tracing::info!(rescheduled, "Connectivity restored");

        self.inner.push_wakeup.notify_one();
        self.inner.reconnect.send_modify(|generation| *generation += 1);
    }

    /// Restart every subscription from its persisted cursor, including
    /// stopped ones.
    pub fn foreground_refresh(&self) {
        tracing::info!("Foreground refresh; restarting subscriptions");
        self.inner.refresh.send_modify(|generation| *generation += 1);
    }

    /// Write the current state to disk now.
    pub async fn flush(&self) -> Result<()> {
        self.inner.persist().await
    }

    /// What was found on disk at startup.
    pub fn startup_report(&self) -> &StartupReport {
        &self.inner.report
    }

    /// Session the engine runs for.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Whether the engine still accepts writes.
    pub fn is_running(&self) -> bool {
        !*self.inner.shutdown.borrow()
    }

    /// Stop background tasks, end observer streams and persist state.
    ///
    /// Queued operations stay in the snapshot and are retried on next start.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.signal_shutdown();

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Background task ended abnormally");
            }
        }

        self.inner.persist().await?;
        tracing::info!("Sync engine stopped");
        Ok(())
    }
}

impl Inner {
    fn signal_shutdown(&self) {
        let was_running = !self.shutdown.send_replace(true);
        if was_running {
            self.feed.close();
            tracing::info!("Sync engine shutting down");
        }
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.replica.read().await.export_snapshot()?;
        self.storage.save(&snapshot).await
    }

    async fn push_one(&self, attempt: PendingOperation) {
        let outcome = self.gateway.push(&attempt).await;
        let jitter_sample: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let now = self.clock.now();

        let resolution = {
            let mut replica = self.replica.write().await;
            match replica.resolve(&attempt, outcome.clone(), now, jitter_sample) {
                Ok(resolution) => {
                    self.feed.publish(&resolution.changes);
                    resolution
                }
                Err(err) => {
                    tracing::debug!(op_id = %attempt.op_id, error = %err, "Dropped stale push outcome");
                    return;
                }
            }
        };

        match &outcome {
            PushOutcome::Acknowledged(revision) => tracing::debug!(
                op_id = %attempt.op_id,
                key = %attempt.key,
                remote_revision = %revision,
                "Push acknowledged"
            ),
            PushOutcome::Rejected(reason) => tracing::warn!(
                op_id = %attempt.op_id,
                key = %attempt.key,
                reason = %reason,
                "Push rejected"
            ),
            PushOutcome::Unreachable => tracing::debug!(
                op_id = %attempt.op_id,
                key = %attempt.key,
                retry_at = ?resolution.retry_at,
                "Remote unreachable; push queued for retry"
            ),
        }

        if let Some(failure) = resolution.failure {
            tracing::warn!(
                op_id = %failure.operation.op_id,
                collection = %failure.operation.collection,
                key = %failure.operation.key,
                reason = %failure.reason,
                "Operation failed"
            );
            // No receivers is fine; the rollback is already visible in the feed.
            let _ = self.failures.send(failure);
        }

        self.dirty.notify_one();
        self.push_wakeup.notify_one();
    }

    async fn apply_remote(&self, change: RemoteChange) {
        let now = self.clock.now();
        let collection = change.collection.clone();
        let key = change.key.clone();
        let revision = change.remote_revision.clone();

        let applied = {
            let mut replica = self.replica.write().await;
            let applied = replica.apply_remote(change, now);
            if let RemoteApply::Applied(changes) = &applied {
                self.feed.publish(changes);
            }
            applied
        };

        match applied {
            RemoteApply::Applied(_) => tracing::debug!(
                collection = %collection,
                key = %key,
                remote_revision = %revision,
                "Remote change applied"
            ),
            RemoteApply::Stale => tracing::trace!(
                collection = %collection,
                key = %key,
                remote_revision = %revision,
                "Remote change already seen"
            ),
            RemoteApply::Deferred => tracing::debug!(
                collection = %collection,
                key = %key,
                remote_revision = %revision,
                "Remote change deferred behind pending operation"
            ),
        }

        self.dirty.notify_one();
    }
}

async fn push_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut pushes = JoinSet::new();

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let now = inner.clock.now();
        let (attempts, wakeup) = {
            let mut replica = inner.replica.write().await;
            let attempts = replica.dispatch_ready(now);
            (attempts, replica.next_wakeup())
        };

        for attempt in attempts {
            tracing::debug!(
                op_id = %attempt.op_id,
                kind = %attempt.kind,
                collection = %attempt.collection,
                key = %attempt.key,
                retry_count = attempt.retry_count,
                "Pushing operation"
            );
            let inner = inner.clone();
            pushes.spawn(async move { inner.push_one(attempt).await });
        }

        let sleep = async {
            match wakeup {
                Some(at) => tokio::time::sleep_until(inner.clock.instant_at(at)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = inner.push_wakeup.notified() => {}
            _ = sleep => {}
            Some(joined) = pushes.join_next(), if !pushes.is_empty() => {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "Push task ended abnormally");
                }
            }
            _ = shutdown.changed() => {}
        }
    }

    // Unfinished pushes stay in flight in the final snapshot and are sent
    // again on next start.
    let interrupted = pushes.len();
    pushes.abort_all();
    while pushes.join_next().await.is_some() {}
    tracing::debug!(interrupted, "Push worker stopped");
}

struct Signals {
    shutdown: watch::Receiver<bool>,
    refresh: watch::Receiver<u64>,
    reconnect: watch::Receiver<u64>,
}

async fn subscription_loop(inner: Arc<Inner>, collection: CollectionName, signals: Signals) {
    let Signals {
        mut shutdown,
        mut refresh,
        mut reconnect,
    } = signals;
    let backoff = *inner.replica.read().await.backoff();
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let since = inner.replica.read().await.cursor(&collection).cloned();
        match inner.gateway.subscribe(&collection, since.clone()).await {
            Ok(mut stream) => {
                failures = 0;
                tracing::info!(
                    collection = %collection,
                    since = ?since.as_ref().map(|c| c.as_str()),
                    "Subscription open"
                );

                loop {
                    tokio::select! {
                        next = stream.next() => match next {
                            Some(change) => inner.apply_remote(change).await,
                            None => {
                                tracing::debug!(collection = %collection, "Subscription ended");
                                break;
                            }
                        },
                        _ = refresh.changed() => break,
                        _ = shutdown.changed() => break,
                    }
                }
            }
            Err(err) if !err.is_retryable() => {
                tracing::error!(
                    collection = %collection,
                    error = %err,
                    "Subscription refused; waiting for refresh"
                );
                inner.stopped.send_modify(|stopped| {
                    stopped.insert(collection.clone(), err);
                });

                tokio::select! {
                    _ = refresh.changed() => {}
                    _ = shutdown.changed() => {}
                }
                inner.stopped.send_modify(|stopped| {
                    stopped.remove(&collection);
                });
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                let jitter_sample: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
                let delay = backoff.delay(failures, jitter_sample);
                tracing::warn!(
                    collection = %collection,
                    error = %err,
                    retry_in_ms = delay,
                    "Subscription failed"
                );

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    _ = reconnect.changed() => {}
                    _ = refresh.changed() => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    tracing::debug!(collection = %collection, "Subscription worker stopped");
}

async fn persist_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        tokio::select! {
            _ = inner.dirty.notified() => {
                if let Err(err) = inner.persist().await {
                    tracing::error!(error = %err, "Failed to persist state");
                }
            }
            _ = shutdown.changed() => {}
        }
    }

    if let Err(err) = inner.persist().await {
        tracing::error!(error = %err, "Failed to persist state on shutdown");
    }
}

async fn session_watch(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow_and_update() {
        return;
    }
    let session = inner.session.clone();

    tokio::select! {
        _ = session.closed() => {
            tracing::info!(user_id = %session.user_id(), "Session closed; stopping sync");
            inner.signal_shutdown();
        }
        _ = shutdown.changed() => {}
    }
}
