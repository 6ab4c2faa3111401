//! Offline-first sync engine.
//!
//! Writes land in the local store and the outbox in one transaction and are
//! returned to the caller immediately. A single-flight drain replays the
//! outbox against the remote, oldest entry first, and binds server ids onto
//! local rows as creates are confirmed. `refresh` pulls a remote snapshot and
//! merges it around whatever is still unconfirmed.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::pending::PendingSet;
use crate::config::{Config, ConfigError, SyncConfig};
use crate::db::{init_db, LocalStore, Outbox, StoreError};
use crate::gateway::{GatewayError, HttpGateway, RemoteGateway};
use crate::models::{Action, DeadLetter, DocRef, Document, DocumentError, OutboxEntry};

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Store(StoreError::Database(e))
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Drain after every write and on reconnect
    pub auto_sync: bool,
    /// Permanent rejections tolerated before an entry is dead-lettered
    pub max_attempts: u32,
    /// Tick of [`SyncEngine::spawn_background`]
    pub refresh_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            auto_sync: config.auto_sync,
            max_attempts: config.max_attempts.max(1),
            refresh_interval: config.refresh_interval(),
        }
    }

    pub fn manual() -> Self {
        Self {
            auto_sync: false,
            ..Self::default()
        }
    }
}

/// Observation hooks for callers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PendingCountChanged(usize),
    CollectionChanged(String),
    DeadLettered { collection: String, entry_id: i64 },
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub sent: usize,
    pub remaining: usize,
    /// Stopped early on a failure; the failed entry is still queued
    pub halted: bool,
    pub dead_lettered: usize,
    /// Nothing was attempted: offline, or another drain was running
    pub skipped: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Entry currently being sent. Never coalesced into or removed.
    in_flight: Option<i64>,
    /// Refreshes whose remote list is outstanding
    refreshing: usize,
    /// Entries confirmed while any refresh was outstanding, in order
    confirmed: Vec<OutboxEntry>,
}

struct Inner {
    store: LocalStore,
    outbox: Outbox,
    gateway: Arc<dyn RemoteGateway>,
    options: EngineOptions,
    online: AtomicBool,
    draining: AtomicBool,
    queue: Mutex<QueueState>,
    tracked: Mutex<BTreeSet<String>>,
    background: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SyncEvent>,
}

/// Releases the single-flight latch when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What the oldest entry turns into when it is sent.
enum Outgoing {
    Create(Document),
    Update(String, Document),
    Delete(String),
    /// The entry no longer refers to anything
    Drop(&'static str),
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        outbox: Outbox,
        gateway: Arc<dyn RemoteGateway>,
        options: EngineOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                outbox,
                gateway,
                options,
                online: AtomicBool::new(true),
                draining: AtomicBool::new(false),
                queue: Mutex::new(QueueState::default()),
                tracked: Mutex::new(BTreeSet::new()),
                background: Mutex::new(None),
                events,
            }),
        }
    }

    /// Opens the local database and wires an HTTP gateway from config.
    pub async fn open(config: &Config) -> Result<Self, EngineError> {
        let pool = init_db(&config.database_path.value).await?;
        let gateway = HttpGateway::from_config(config)?;

        let engine = Self::new(
            LocalStore::new(pool.clone()),
            Outbox::new(pool),
            Arc::new(gateway),
            EngineOptions::from_config(&config.sync),
        );

        let collections = engine.inner.store.collections().await?;
        engine.inner.tracked.lock().await.extend(collections);

        tracing::info!(
            "Opened sync engine at {} ({} pending)",
            config.database_path.value.display(),
            engine.pending_count().await?
        );
        Ok(engine)
    }

    /// Stops the background task and closes the database.
    pub async fn close(&self) {
        if let Some(handle) = self.inner.background.lock().await.take() {
            handle.abort();
        }
        self.inner.store.pool().close().await;
        tracing::info!("Sync engine closed");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Flips the connectivity flag. Coming back online drains the outbox and
    /// refreshes every tracked collection.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            tracing::info!("Back online");
            if self.inner.options.auto_sync {
                self.spawn_task(|engine| async move { engine.catch_up().await });
            }
        } else if !online && was_online {
            tracing::info!("Offline, writes will queue");
        }
    }

    /// Saves a document optimistically and queues it for the remote.
    ///
    /// Never waits on the network: with auto sync on, the drain runs in a
    /// spawned task.
    pub async fn save(&self, collection: &str, payload: Value) -> Result<Document, EngineError> {
        let mut document = Document::from_value(collection, payload)?;

        let queue = self.inner.queue.lock().await;
        let mut tx = self.inner.store.pool().begin().await?;

        // Keep identity the store already knows
        let existing = match (&document.server_id, document.local_id) {
            (_, Some(local_id)) => LocalStore::get_in(&mut *tx, collection, local_id).await?,
            (Some(server_id), None) => {
                LocalStore::find_by_server_id_in(&mut *tx, collection, server_id).await?
            }
            (None, None) => None,
        };
        if let Some(existing) = existing {
            document.local_id = existing.local_id;
            document.server_id = document.server_id.or(existing.server_id);
            document.correlation_id = document.correlation_id.or(existing.correlation_id);
        }
        if document.server_id.is_none() && document.correlation_id.is_none() {
            document.correlation_id = Some(Uuid::new_v4());
        }

        let local_id = LocalStore::put_in(&mut *tx, &document).await?;
        document.local_id = Some(local_id);

        let entry = OutboxEntry::upsert(&document);
        let entry_id = Outbox::coalesce_in(&mut *tx, local_id, &entry, queue.in_flight).await?;
        tx.commit().await?;
        drop(queue);

        tracing::debug!(
            collection,
            local_id,
            entry_id,
            action = %entry.action,
            "Saved document"
        );

        self.after_write(collection).await?;
        Ok(document)
    }

    /// Deletes a document by local or server id. Returns `false` when the
    /// document is unknown.
    pub async fn delete(
        &self,
        collection: &str,
        id: impl Into<DocRef>,
    ) -> Result<bool, EngineError> {
        let id = id.into();

        let queue = self.inner.queue.lock().await;
        let mut tx = self.inner.store.pool().begin().await?;

        let existing = match &id {
            DocRef::Local(local_id) => LocalStore::get_in(&mut *tx, collection, *local_id).await?,
            DocRef::Server(server_id) => {
                LocalStore::find_by_server_id_in(&mut *tx, collection, server_id).await?
            }
        };

        let server_id = match (&existing, &id) {
            (Some(doc), _) => doc.server_id.clone(),
            // Not cached, but the remote may still have it
            (None, DocRef::Server(server_id)) => Some(server_id.clone()),
            (None, DocRef::Local(_)) => return Ok(false),
        };
        let local_id = existing.as_ref().and_then(|doc| doc.local_id);

        if let Some(local_id) = local_id {
            LocalStore::delete_in(&mut *tx, collection, local_id).await?;
            Outbox::remove_for_local_in(&mut *tx, collection, local_id, queue.in_flight).await?;
        }
        if let Some(server_id) = &server_id {
            Outbox::enqueue_in(
                &mut *tx,
                &OutboxEntry::delete(collection, server_id.as_str(), local_id),
            )
            .await?;
        }
        tx.commit().await?;
        drop(queue);

        tracing::debug!(collection, %id, remote = server_id.is_some(), "Deleted document");

        self.after_write(collection).await?;
        Ok(true)
    }

    /// Removes every cached document of a collection and queues remote
    /// deletes for the ones the server knows.
    pub async fn clear(&self, collection: &str) -> Result<usize, EngineError> {
        let queue = self.inner.queue.lock().await;
        let mut tx = self.inner.store.pool().begin().await?;

        let removed = LocalStore::clear_in(&mut *tx, collection).await?;
        Outbox::remove_writes_in(&mut *tx, collection, queue.in_flight).await?;

        let mut server_ids = BTreeSet::new();
        for doc in &removed {
            if let Some(server_id) = &doc.server_id {
                if server_ids.insert(server_id.clone()) {
                    Outbox::enqueue_in(
                        &mut *tx,
                        &OutboxEntry::delete(collection, server_id.as_str(), doc.local_id),
                    )
                    .await?;
                }
            }
        }
        tx.commit().await?;
        drop(queue);

        tracing::info!(collection, removed = removed.len(), "Cleared collection");

        self.after_write(collection).await?;
        Ok(removed.len())
    }

    /// Cached documents of a collection. Never touches the network.
    pub async fn list(&self, collection: &str) -> Result<Vec<Document>, EngineError> {
        self.track(collection).await;
        Ok(self.inner.store.query(collection).await?)
    }

    pub async fn get(&self, collection: &str, local_id: i64) -> Result<Option<Document>, EngineError> {
        Ok(self.inner.store.get(collection, local_id).await?)
    }

    pub async fn pending_count(&self) -> Result<usize, EngineError> {
        Ok(self.inner.outbox.count().await?)
    }

    /// Pending mutations per collection, in name order.
    pub async fn pending_by_collection(&self) -> Result<BTreeMap<String, usize>, EngineError> {
        let mut counts = BTreeMap::new();
        for entry in self.inner.outbox.all().await? {
            *counts.entry(entry.collection).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// The remote copy of a collection, read without touching the cache.
    /// Empty when offline or when the remote cannot be reached.
    pub async fn peek_remote(&self, collection: &str) -> Vec<Document> {
        if !self.is_online() {
            return Vec::new();
        }
        self.inner.gateway.list_or_empty(collection).await
    }

    pub async fn pending(&self, collection: &str) -> Result<Vec<OutboxEntry>, EngineError> {
        Ok(self.inner.outbox.all_pending(collection).await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, EngineError> {
        Ok(self.inner.outbox.dead_letters().await?)
    }

    /// Explicitly drops queued and dead-lettered work for a collection.
    pub async fn discard_pending(&self, collection: &str) -> Result<u64, EngineError> {
        let queue = self.inner.queue.lock().await;
        let discarded = self.inner.outbox.discard(collection).await?;
        drop(queue);

        tracing::warn!(collection, discarded, "Discarded pending mutations");
        self.notify_pending().await?;
        Ok(discarded)
    }

    /// Drains the outbox, oldest entry first.
    ///
    /// Only one drain runs at a time; a concurrent call returns a skipped
    /// report straight away. Remote failures are reported, not returned.
    pub async fn sync(&self) -> Result<SyncReport, EngineError> {
        if !self.is_online() {
            return Ok(SyncReport {
                skipped: true,
                remaining: self.pending_count().await?,
                ..SyncReport::default()
            });
        }

        let Some(_guard) = DrainGuard::acquire(&self.inner.draining) else {
            tracing::debug!("Drain already running");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        };

        let mut report = SyncReport::default();
        let result = self.drain(&mut report).await;

        // The latch must not outlive a failed drain
        {
            let mut queue = self.inner.queue.lock().await;
            queue.in_flight = None;
        }
        result?;

        report.remaining = self.pending_count().await?;
        if report.sent > 0 || report.halted || report.dead_lettered > 0 {
            tracing::info!(
                sent = report.sent,
                remaining = report.remaining,
                dead_lettered = report.dead_lettered,
                halted = report.halted,
                "Sync finished"
            );
        }
        Ok(report)
    }

    async fn drain(&self, report: &mut SyncReport) -> Result<(), EngineError> {
        loop {
            let (entry, send) = {
                let mut queue = self.inner.queue.lock().await;
                let mut conn = self.inner.store.pool().acquire().await?;
                let Some(entry) = Outbox::peek_oldest_in(&mut *conn).await? else {
                    return Ok(());
                };
                let send = self.resolve(&mut *conn, &entry).await?;
                queue.in_flight = Some(entry.id);
                (entry, send)
            };

            let result = match &send {
                Outgoing::Create(payload) => self
                    .inner
                    .gateway
                    .create(&entry.collection, payload)
                    .await
                    .map(Some),
                Outgoing::Update(server_id, payload) => self
                    .inner
                    .gateway
                    .update(&entry.collection, server_id, payload)
                    .await
                    .map(Some),
                Outgoing::Delete(server_id) => {
                    match self.inner.gateway.delete(&entry.collection, server_id).await {
                        // Already gone is as good as deleted
                        Err(GatewayError::Rejected { status: 404, .. }) | Ok(()) => Ok(None),
                        Err(e) => Err(e),
                    }
                }
                Outgoing::Drop(reason) => {
                    tracing::debug!(entry_id = entry.id, reason, "Dropping outbox entry");
                    Ok(None)
                }
            };

            let mut queue = self.inner.queue.lock().await;
            queue.in_flight = None;

            match result {
                Ok(remote) => {
                    self.confirm(&mut queue, &entry, remote).await?;
                    if !matches!(send, Outgoing::Drop(_)) {
                        report.sent += 1;
                    }
                    drop(queue);
                    self.notify_pending().await?;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        entry_id = entry.id,
                        collection = %entry.collection,
                        error = %e,
                        "Remote unavailable, sync halted"
                    );
                    report.halted = true;
                    return Ok(());
                }
                Err(e) => {
                    let attempts = self
                        .inner
                        .outbox
                        .record_failure(entry.id, &e.to_string())
                        .await?;

                    if attempts < i64::from(self.inner.options.max_attempts) {
                        tracing::warn!(
                            entry_id = entry.id,
                            collection = %entry.collection,
                            attempts,
                            error = %e,
                            "Remote rejected entry, sync halted"
                        );
                        report.halted = true;
                        return Ok(());
                    }

                    self.inner.outbox.dead_letter(entry.id).await?;
                    drop(queue);
                    tracing::error!(
                        entry_id = entry.id,
                        collection = %entry.collection,
                        attempts,
                        error = %e,
                        "Entry dead-lettered"
                    );
                    report.dead_lettered += 1;
                    self.emit(SyncEvent::DeadLettered {
                        collection: entry.collection.clone(),
                        entry_id: entry.id,
                    });
                    self.notify_pending().await?;
                }
            }
        }
    }

    /// Decides the request for an entry from the current local row, so a
    /// queued create whose document has meanwhile gained a server id goes
    /// out as an update.
    async fn resolve(
        &self,
        conn: &mut sqlx::SqliteConnection,
        entry: &OutboxEntry,
    ) -> Result<Outgoing, EngineError> {
        if entry.action == Action::Delete {
            return Ok(match entry.target_server_id() {
                Some(server_id) => Outgoing::Delete(server_id.to_string()),
                None => Outgoing::Drop("delete without server id"),
            });
        }

        let mut payload = entry.payload.snapshot();
        if let Some(local_id) = entry.local_id {
            match LocalStore::get_in(conn, &entry.collection, local_id).await? {
                Some(row) => {
                    payload.server_id = payload.server_id.or(row.server_id);
                    payload.correlation_id = payload.correlation_id.or(row.correlation_id);
                }
                None => return Ok(Outgoing::Drop("document deleted locally")),
            }
        }

        Ok(match payload.server_id.clone() {
            Some(server_id) => Outgoing::Update(server_id, payload),
            None => Outgoing::Create(payload),
        })
    }

    /// Applies a confirmed entry: binds the server id of a create and
    /// dequeues.
    async fn confirm(
        &self,
        queue: &mut QueueState,
        entry: &OutboxEntry,
        remote: Option<Document>,
    ) -> Result<(), EngineError> {
        let mut tx = self.inner.store.pool().begin().await?;

        let created = remote
            .filter(|_| entry.action != Action::Delete)
            .and_then(|doc| doc.server_id);
        if let (Some(server_id), Some(local_id)) = (&created, entry.local_id) {
            let bound =
                LocalStore::bind_server_id_in(&mut *tx, &entry.collection, local_id, server_id)
                    .await?;
            if bound {
                tracing::debug!(
                    collection = %entry.collection,
                    local_id,
                    server_id = %server_id,
                    "Bound server id"
                );
            } else {
                // Deleted while the create was in flight
                tracing::debug!(
                    collection = %entry.collection,
                    server_id = %server_id,
                    "Scheduling delete of orphaned remote document"
                );
                Outbox::enqueue_in(
                    &mut *tx,
                    &OutboxEntry::delete(entry.collection.as_str(), server_id.as_str(), Some(local_id)),
                )
                .await?;
            }
        }

        Outbox::dequeue_in(&mut *tx, entry.id).await?;
        tx.commit().await?;

        // An outstanding refresh still has to treat this entry as pending
        if queue.refreshing > 0 {
            queue.confirmed.push(entry.clone());
        }

        tracing::debug!(entry_id = entry.id, action = %entry.action, "Confirmed outbox entry");
        Ok(())
    }

    /// Pulls a remote snapshot and merges it into the cache.
    ///
    /// Returns `false` when offline or when the remote could not be reached;
    /// the cache is left untouched in that case.
    pub async fn refresh(&self, collection: &str) -> Result<bool, EngineError> {
        self.track(collection).await;
        if !self.is_online() {
            return Ok(false);
        }

        let since = {
            let mut queue = self.inner.queue.lock().await;
            queue.refreshing += 1;
            queue.confirmed.len()
        };

        let result = self.merge_remote(collection, since).await;

        {
            let mut queue = self.inner.queue.lock().await;
            queue.refreshing -= 1;
            if queue.refreshing == 0 {
                queue.confirmed.clear();
            }
        }
        result
    }

    /// Lists the remote and merges it around the work that was pending at
    /// any point since `since`.
    async fn merge_remote(&self, collection: &str, since: usize) -> Result<bool, EngineError> {
        let remote = match self.inner.gateway.list(collection).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(collection, error = %e, "Refresh failed, keeping cache");
                return Ok(false);
            }
        };

        let queue = self.inner.queue.lock().await;
        let entries = self.inner.outbox.all_pending(collection).await?;
        let mut pending = PendingSet::from_entries(&entries);
        // Confirmed while the list was in flight; the snapshot may predate them
        pending.merge(PendingSet::from_entries(
            queue.confirmed[since..]
                .iter()
                .filter(|entry| entry.collection == collection),
        ));

        let mut fresh = Vec::with_capacity(remote.len());
        for doc in remote {
            let Some(server_id) = doc.server_id.clone() else {
                continue;
            };
            if pending.is_deleted(&server_id) {
                continue;
            }
            if let Some(local_id) = pending.claim_create(&doc) {
                // The remote already holds our pending create
                self.inner
                    .store
                    .bind_server_id(collection, local_id, &server_id)
                    .await?;
                continue;
            }
            fresh.push(doc);
        }

        let summary = self
            .inner
            .store
            .bulk_replace(collection, |doc| pending.protects(doc), fresh)
            .await?;
        drop(queue);

        tracing::debug!(
            collection,
            kept = summary.kept,
            removed = summary.removed,
            inserted = summary.inserted,
            "Refreshed collection"
        );
        self.emit(SyncEvent::CollectionChanged(collection.to_string()));
        Ok(true)
    }

    /// Runs `sync` then refreshes every collection this engine has seen.
    pub async fn catch_up(&self) -> Result<SyncReport, EngineError> {
        let report = self.sync().await?;
        for collection in self.tracked_collections().await {
            self.refresh(&collection).await?;
        }
        Ok(report)
    }

    /// Starts a periodic [`catch_up`](Self::catch_up). Replaces any earlier
    /// background task; stopped by [`close`](Self::close).
    pub async fn spawn_background(&self, interval: Option<Duration>) {
        let period = interval.unwrap_or(self.inner.options.refresh_interval);
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !engine.is_online() {
                    continue;
                }
                if let Err(e) = engine.catch_up().await {
                    tracing::warn!("Background sync failed: {}", e);
                }
            }
        });

        if let Some(previous) = self.inner.background.lock().await.replace(handle) {
            previous.abort();
        }
        tracing::debug!("Background sync every {:?}", period);
    }

    /// Collections seen by this engine, in name order.
    pub async fn tracked_collections(&self) -> Vec<String> {
        self.inner.tracked.lock().await.iter().cloned().collect()
    }

    /// Probes the remote with a list of the first tracked collection.
    /// `None` when there is nothing to probe with.
    pub async fn check_remote(&self) -> Option<bool> {
        let collection = self.tracked_collections().await.into_iter().next()?;
        Some(self.inner.gateway.list(&collection).await.is_ok())
    }

    async fn after_write(&self, collection: &str) -> Result<(), EngineError> {
        self.track(collection).await;
        self.notify_pending().await?;
        self.emit(SyncEvent::CollectionChanged(collection.to_string()));

        if self.inner.options.auto_sync && self.is_online() {
            self.spawn_task(|engine| async move { engine.sync().await });
        }
        Ok(())
    }

    /// Fire-and-forget on the current runtime, if there is one.
    fn spawn_task<F, Fut>(&self, task: F)
    where
        F: FnOnce(SyncEngine) -> Fut,
        Fut: std::future::Future<Output = Result<SyncReport, EngineError>> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime, skipping background sync");
            return;
        };
        let future = task(self.clone());
        handle.spawn(async move {
            if let Err(e) = future.await {
                tracing::warn!("Background sync failed: {}", e);
            }
        });
    }

    async fn track(&self, collection: &str) {
        let mut tracked = self.inner.tracked.lock().await;
        if !tracked.contains(collection) {
            tracked.insert(collection.to_string());
        }
    }

    async fn notify_pending(&self) -> Result<(), EngineError> {
        let count = self.pending_count().await?;
        self.emit(SyncEvent::PendingCountChanged(count));
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}
