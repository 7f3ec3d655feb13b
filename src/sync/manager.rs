//! Sync Manager - replays the offline queue against the remote API
//!
//! Coordinates between the durable queue, the conflict store, the local
//! mirror and the API client. Handles:
//! - Single-flight drain passes in queue order
//! - Optimistic-concurrency checks against the server's `updated_at`
//! - Conflict recording and explicit resolution
//! - Publishing `SyncState` to subscribers after every change
//!
//! A pass stops at the first item that fails with a transport or storage
//! error. Later items stay queued so an edit is never applied before the
//! ones it was made on top of.

use super::api::{RemoteAuthority, SyncApiError};
use super::conflicts::{ConflictError, ConflictStore};
use super::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use super::mirror::{LocalMirror, MirrorError};
use super::models::{
    ChecklistResponse, Conflict, ConflictResolution, EntityUpdate, MaterialsUpdate, Mutation,
    NewConflict, QueueItem, ReferenceType, SyncState, VersionCheck,
};
use super::queue::{QueueError, QueueManager};
use crate::db::{Database, DbError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::Notify;

type Listener = Arc<dyn Fn(&SyncState) + Send + Sync>;
type ListenerMap = StdMutex<BTreeMap<u64, Listener>>;

/// Sync manager - owns the replay loop and the published state
#[derive(Clone)]
pub struct SyncManager {
    queue: QueueManager,
    conflicts: ConflictStore,
    mirror: LocalMirror,
    remote: Arc<dyn RemoteAuthority>,
    connectivity: ConnectivityMonitor,
    is_syncing: Arc<AtomicBool>,
    state_initialized: Arc<AtomicBool>,
    queue_length: Arc<AtomicUsize>,
    conflict_count: Arc<AtomicUsize>,
    listeners: Arc<ListenerMap>,
    next_listener_id: Arc<AtomicU64>,
    drain_requested: Arc<Notify>,
}

/// Terminal outcome of one queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Applied,
    Conflicted,
}

impl SyncManager {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteAuthority>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        Self::with_mirror(db.clone(), remote, connectivity, LocalMirror::new(db))
    }

    pub fn with_mirror(
        db: Arc<Database>,
        remote: Arc<dyn RemoteAuthority>,
        connectivity: ConnectivityMonitor,
        mirror: LocalMirror,
    ) -> Self {
        Self {
            queue: QueueManager::new(db.clone()),
            conflicts: ConflictStore::new(db),
            mirror,
            remote,
            connectivity,
            is_syncing: Arc::new(AtomicBool::new(false)),
            state_initialized: Arc::new(AtomicBool::new(false)),
            queue_length: Arc::new(AtomicUsize::new(0)),
            conflict_count: Arc::new(AtomicUsize::new(0)),
            listeners: Arc::new(StdMutex::new(BTreeMap::new())),
            next_listener_id: Arc::new(AtomicU64::new(1)),
            drain_requested: Arc::new(Notify::new()),
        }
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    // ========================================================================
    // Published state
    // ========================================================================

    /// Current state snapshot
    pub fn state(&self) -> SyncState {
        SyncState {
            is_syncing: self.is_syncing.load(Ordering::Acquire),
            queue_length: self.queue_length.load(Ordering::Acquire),
            conflict_count: self.conflict_count.load(Ordering::Acquire),
            is_online: self.connectivity.is_online(),
        }
    }

    /// Register a listener. It is called with the current state right away
    /// and after every change until the returned subscription is dropped.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(listener);

        lock_listeners(&self.listeners).insert(id, listener.clone());
        notify_listener(&listener, &self.state());
        self.initialize_state();

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn emit_state(&self) {
        let state = self.state();
        // Snapshot so listeners may (un)subscribe while being notified
        let listeners: Vec<Listener> = lock_listeners(&self.listeners).values().cloned().collect();
        for listener in listeners {
            notify_listener(&listener, &state);
        }
    }

    /// Re-read durable counts
    fn refresh_counts(&self) {
        match self.queue.len() {
            Ok(len) => self.queue_length.store(len, Ordering::Release),
            Err(e) => log::error!("Failed to count sync queue: {}", e),
        }
        match self.conflicts.len() {
            Ok(len) => self.conflict_count.store(len, Ordering::Release),
            Err(e) => log::error!("Failed to count conflicts: {}", e),
        }
    }

    /// Recount and broadcast
    pub(crate) fn publish(&self) {
        self.refresh_counts();
        self.emit_state();
    }

    /// Load counts from storage once, on first use
    fn initialize_state(&self) {
        if self.state_initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.publish();
    }

    // ========================================================================
    // Public mutation API
    // ========================================================================

    /// Queue a mutation and ask for a drain
    pub async fn enqueue(&self, mutation: Mutation) -> Result<QueueItem, SyncManagerError> {
        self.initialize_state();

        let item = self.queue.enqueue(mutation)?;
        self.publish();

        if self.connectivity.is_online() {
            self.request_drain();
        }
        Ok(item)
    }

    pub async fn enqueue_order_update(&self, update: EntityUpdate) -> Result<QueueItem, SyncManagerError> {
        self.enqueue(Mutation::OrderUpdate(update)).await
    }

    pub async fn enqueue_call_update(&self, update: EntityUpdate) -> Result<QueueItem, SyncManagerError> {
        self.enqueue(Mutation::CallUpdate(update)).await
    }

    pub async fn enqueue_checklist_response(
        &self,
        response: ChecklistResponse,
    ) -> Result<QueueItem, SyncManagerError> {
        self.enqueue(Mutation::ChecklistResponse(response)).await
    }

    pub async fn enqueue_materials_update(
        &self,
        update: MaterialsUpdate,
    ) -> Result<QueueItem, SyncManagerError> {
        self.enqueue(Mutation::MaterialsUpdate(update)).await
    }

    pub async fn queue_length(&self) -> usize {
        self.initialize_state();
        self.queue_length.load(Ordering::Acquire)
    }

    /// Unresolved conflicts, optionally only those of one order or call
    pub async fn list_conflicts(
        &self,
        reference: Option<(ReferenceType, i64)>,
    ) -> Result<Vec<Conflict>, SyncManagerError> {
        self.initialize_state();

        let conflicts = match reference {
            Some((reference_type, reference_id)) => {
                self.conflicts.list_by_reference(reference_type, reference_id)?
            }
            None => self.conflicts.list()?,
        };
        Ok(conflicts)
    }

    /// Resolve a conflict. Returns the server snapshot the conflict held,
    /// or `None` if the id is unknown or already resolved.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        action: ConflictResolution,
    ) -> Result<Option<serde_json::Value>, SyncManagerError> {
        self.initialize_state();

        let Some(conflict) = self.conflicts.get(conflict_id)? else {
            log::debug!("Conflict {} already resolved", conflict_id);
            return Ok(None);
        };

        let mut requeued = None;
        match action {
            ConflictResolution::ApplyOffline => {
                let item = self.queue.enqueue(conflict.mutation.clone().forced())?;
                log::info!("Conflict {} re-queued as forced item {}", conflict.id, item.id);
                requeued = Some(item.id);
            }
            ConflictResolution::AcceptServer => {
                if let (Some(reference_type), false) =
                    (conflict.reference_type, conflict.server_data.is_null())
                {
                    self.mirror
                        .cache_entity(reference_type, &conflict.server_data)
                        .await?;
                }
                log::info!("Conflict {} resolved with server data", conflict.id);
            }
        }

        if let Err(e) = self.conflicts.remove(&conflict.id) {
            // The conflict survives, so the forced copy must not
            if let Some(item_id) = requeued {
                if let Err(rollback) = self.queue.remove(&item_id) {
                    log::error!("Failed to roll back queue item {}: {}", item_id, rollback);
                }
            }
            self.publish();
            return Err(e.into());
        }
        self.publish();

        if requeued.is_some() {
            self.request_drain();
        }

        Ok(Some(conflict.server_data))
    }

    // ========================================================================
    // Drain
    // ========================================================================

    /// Ask the background scheduler for a drain pass
    pub fn request_drain(&self) {
        self.drain_requested.notify_one();
    }

    /// Resolves when a drain has been requested since the last call
    pub(crate) async fn drain_requested(&self) {
        self.drain_requested.notified().await;
    }

    /// React to a connectivity edge
    pub async fn handle_connectivity_event(&self, event: ConnectivityEvent) -> Option<DrainReport> {
        self.emit_state();
        match event {
            ConnectivityEvent::BecameOnline => Some(self.trigger_drain(false).await),
            ConnectivityEvent::BecameOffline => None,
        }
    }

    /// Run one pass over the queue.
    ///
    /// Returns immediately (with `skipped` set) when offline and not forced,
    /// or when another pass is already running. Handler failures are
    /// reported in the returned summary, never as errors.
    pub async fn trigger_drain(&self, force: bool) -> DrainReport {
        if !force && !self.connectivity.is_online() {
            log::debug!("Offline, skipping sync pass");
            return DrainReport::skipped();
        }

        let Some(guard) = SyncingGuard::acquire(&self.is_syncing) else {
            log::debug!("Sync pass already running, ignoring request");
            return DrainReport::skipped();
        };

        self.initialize_state();
        self.emit_state();

        let mut report = self.run_pass().await;

        drop(guard);
        self.publish();

        report.remaining = self.queue_length.load(Ordering::Acquire);
        report
    }

    async fn run_pass(&self) -> DrainReport {
        let mut report = DrainReport::default();

        let items = match self.queue.drain() {
            Ok(items) => items,
            Err(e) => {
                log::error!("Failed to read sync queue: {}", e);
                report.stopped_on_error = true;
                return report;
            }
        };
        self.publish();

        if items.is_empty() {
            return report;
        }
        log::info!("Sync pass started with {} queued items", items.len());

        for item in &items {
            match self.handle_item(item).await {
                Ok(ItemOutcome::Applied) => report.applied += 1,
                Ok(ItemOutcome::Conflicted) => report.conflicted += 1,
                Err(e) => {
                    log::error!(
                        "Sync pass stopped at {} ({}): {}",
                        item.id,
                        item.kind(),
                        e
                    );
                    report.stopped_on_error = true;
                    break;
                }
            }
        }

        log::info!(
            "Sync pass finished: applied={}, conflicted={}, stopped_on_error={}",
            report.applied,
            report.conflicted,
            report.stopped_on_error
        );
        report
    }

    async fn handle_item(&self, item: &QueueItem) -> Result<ItemOutcome, SyncManagerError> {
        log::debug!("Dispatching {} {}", item.kind(), item.id);

        match &item.mutation {
            // Append-only on the server
            Mutation::ChecklistResponse(_) => self.apply_item(item).await,
            Mutation::OrderUpdate(_) | Mutation::CallUpdate(_) | Mutation::MaterialsUpdate(_) => {
                match item.mutation.version_check() {
                    Some(check) => self.apply_checked(item, check).await,
                    None => self.apply_item(item).await,
                }
            }
        }
    }

    /// Compare the server's stamp with the baseline before applying
    async fn apply_checked(
        &self,
        item: &QueueItem,
        check: VersionCheck,
    ) -> Result<ItemOutcome, SyncManagerError> {
        match self
            .remote
            .fetch_record(check.reference_type, check.reference_id)
            .await
        {
            Ok(server_data) => match version_token(&server_data) {
                Some(current) if current != check.baseline_updated_at => {
                    log::warn!(
                        "{} {} changed on server ({} -> {})",
                        check.reference_type,
                        check.reference_id,
                        check.baseline_updated_at,
                        current
                    );
                    self.record_conflict(item, check, server_data)?;
                    return Ok(ItemOutcome::Conflicted);
                }
                Some(_) => {}
                None => log::warn!(
                    "{} {} has no updated_at, applying without version check",
                    check.reference_type,
                    check.reference_id
                ),
            },
            Err(e) => log::warn!(
                "Could not verify {} {} before sync, applying anyway: {}",
                check.reference_type,
                check.reference_id,
                e
            ),
        }

        self.apply_item(item).await
    }

    async fn apply_item(&self, item: &QueueItem) -> Result<ItemOutcome, SyncManagerError> {
        self.remote.apply(&item.mutation.remote_request()).await?;
        self.queue.remove(&item.id)?;
        self.publish();

        log::info!("Applied {} {}", item.kind(), item.id);
        Ok(ItemOutcome::Applied)
    }

    /// Move an item from the queue into the conflict store
    fn record_conflict(
        &self,
        item: &QueueItem,
        check: VersionCheck,
        server_data: serde_json::Value,
    ) -> Result<(), SyncManagerError> {
        let conflict = self.conflicts.record(NewConflict {
            mutation: item.mutation.clone(),
            baseline_updated_at: Some(check.baseline_updated_at),
            server_data,
        })?;

        if let Err(e) = self.queue.remove(&item.id) {
            // The item stays queued, so the conflict must not exist twice
            if let Err(rollback) = self.conflicts.remove(&conflict.id) {
                log::error!("Failed to roll back conflict {}: {}", conflict.id, rollback);
            }
            return Err(e.into());
        }

        self.publish();
        Ok(())
    }
}

/// Server version stamp of a record
fn version_token(record: &serde_json::Value) -> Option<String> {
    match record.get("updated_at")? {
        serde_json::Value::Null => None,
        serde_json::Value::String(stamp) => Some(stamp.clone()),
        other => Some(other.to_string()),
    }
}

fn lock_listeners(listeners: &ListenerMap) -> std::sync::MutexGuard<'_, BTreeMap<u64, Listener>> {
    listeners.lock().unwrap_or_else(|poisoned| {
        log::warn!("Sync listener registry was poisoned, recovering");
        poisoned.into_inner()
    })
}

fn notify_listener(listener: &Listener, state: &SyncState) {
    if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
        log::error!("Sync state listener panicked");
    }
}

/// Clears the single-flight flag when the pass ends, even on panic
struct SyncingGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SyncingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Handle returned by [`SyncManager::subscribe`]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock_listeners(&listeners).remove(&self.id);
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Pass did not run (offline or another pass active)
    pub skipped: bool,
    pub applied: usize,
    pub conflicted: usize,
    /// Queue length after the pass
    pub remaining: usize,
    pub stopped_on_error: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Conflict store error: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Local mirror error: {0}")]
    Mirror(#[from] MirrorError),

    #[error("API error: {0}")]
    Api(#[from] SyncApiError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

// ============================================================================
// Tests
// ============================================================================
