//! Sync engine
//!
//! Coordinates a sync cycle as a state machine:
//!
//! ```text
//! Idle -> Pulling -> Pushing -> Idle
//!            |          |
//!            +--> ResolvingConflicts --> (back to the interrupted phase)
//!
//! Pulling/Pushing --transient failure--> Error
//! ```
//!
//! The engine owns the local store, the mutation queue and the parked
//! conflicts. Every method takes `&mut self`, so local edits, cycles and
//! resolutions are serialized by construction; the sync service adds the
//! task and channel plumbing around it.
//!
//! Each remote call is bounded by the configured request timeout. A timed
//! out push batch is requeued and the cycle carries on with the next batch;
//! any other transient failure ends the cycle in `Error` with the queue
//! intact. A push request the remote refuses as a whole (bad credentials,
//! wrong URL) also ends the cycle; only a per-record `rejected` verdict
//! moves a mutation to the error list.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, SyncConfig, SyncConfigPatch};
use crate::conflict::{detect, ConflictItem};
use crate::error::{SyncError, SyncResult};
use crate::models::{Entity, EntityKey, EntityType, Operation, Payload, ValidationError};
use crate::network::NetworkMonitor;
use crate::queue::{FailedMutation, FailureKind, MutationQueue, MutationRecord, RequeueOutcome};
use crate::remote::{HttpRemote, PushOutcome, PushStatus, RemoteApi, RemoteError};
use crate::resolver::{self, QueueAction, Resolution, ResolutionPlan, StoreWrite};
use crate::status::{StatusBroadcaster, SyncErrorEntry, SyncErrorKind, SyncState, SyncStatus};
use crate::storage::StorageResult;
use crate::store::LocalStore;

/// Which phases a cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phases {
    Full,
    PullOnly,
    PushOnly,
}

impl Phases {
    fn pulls(self) -> bool {
        matches!(self, Phases::Full | Phases::PullOnly)
    }

    fn pushes(self) -> bool {
        matches!(self, Phases::Full | Phases::PushOnly)
    }
}

/// What a cycle did
///
/// A cycle returns `Ok` once it ran to the end, even if the remote rejected
/// some records or conflicts were parked. Check [`CycleReport::is_clean`]
/// (or `failed` and `parked`) before telling the user everything synced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Remote changes written to the local store
    pub pulled: usize,
    /// Mutations the remote accepted
    pub pushed: usize,
    /// Conflicts detected (resolved automatically or parked)
    pub conflicts: usize,
    /// Conflicts left for a manual decision
    pub parked: usize,
    /// Mutations moved to the error list
    pub failed: usize,
    /// Mutations kept for a later attempt
    pub retried: usize,
}

impl CycleReport {
    /// Nothing failed, nothing was parked and nothing is waiting for a retry
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.parked == 0 && self.retried == 0
    }
}

pub struct SyncEngine {
    store: LocalStore,
    queue: MutationQueue,
    config: SyncConfig,
    remote: Option<Arc<dyn RemoteApi>>,
    network: Arc<NetworkMonitor>,
    broadcaster: StatusBroadcaster,
    conflicts: Vec<ConflictItem>,
    last_sync_time: Option<DateTime<Utc>>,
    state: SyncState,
    sync_in_progress: bool,
    cycle_error: Option<SyncErrorEntry>,
}

impl SyncEngine {
    /// Build an engine over an opened store
    pub fn new(
        store: LocalStore,
        config: SyncConfig,
        remote: Option<Arc<dyn RemoteApi>>,
        network: Arc<NetworkMonitor>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let queue = MutationQueue::load(&store, config.max_retries)?;
        let conflicts = store.load_conflicts()?;
        let last_sync_time = store.last_sync_time()?;

        let mut engine = Self {
            store,
            queue,
            config,
            remote,
            network,
            broadcaster: StatusBroadcaster::default(),
            conflicts,
            last_sync_time,
            state: SyncState::Idle,
            sync_in_progress: false,
            cycle_error: None,
        };
        engine.broadcaster = StatusBroadcaster::new(engine.status());

        debug!(
            pending = engine.queue.len(),
            conflicts = engine.conflicts.len(),
            "Sync engine ready"
        );
        Ok(engine)
    }

    /// Open the store in the data directory and connect the configured remote
    pub fn open(config: &Config, network: Arc<NetworkMonitor>) -> SyncResult<Self> {
        let store = LocalStore::open(config)?;
        let remote = match &config.remote_url {
            Some(url) => {
                let http = HttpRemote::new(url.as_str(), config.sync.request_timeout())?;
                Some(Arc::new(http) as Arc<dyn RemoteApi>)
            }
            None => None,
        };
        Self::new(store, config.sync.clone(), remote, network)
    }

    // ==================== Accessors ====================

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.last_sync_time
    }

    /// Conflicts waiting for a manual decision
    pub fn conflicts(&self) -> &[ConflictItem] {
        &self.conflicts
    }

    /// Current status snapshot
    pub fn status(&self) -> SyncStatus {
        let errors = self
            .cycle_error
            .iter()
            .cloned()
            .chain(self.queue.failed().iter().map(failed_entry))
            .collect();

        SyncStatus {
            is_online: self.network.is_online(),
            last_sync_time: self.last_sync_time,
            pending_changes: self.queue.len(),
            sync_in_progress: self.sync_in_progress,
            errors,
            state: self.state,
            conflicts: self.conflicts.len(),
        }
    }

    /// Publish the current status to listeners
    pub fn publish(&self) {
        self.broadcaster.publish(self.status());
    }

    fn transition(&mut self, state: SyncState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Sync state transition");
        }
        self.state = state;
        self.publish();
    }

    // ==================== Local edits ====================

    pub fn queue_recipe_change(
        &mut self,
        id: &str,
        operation: Operation,
        data: Option<Value>,
    ) -> SyncResult<Option<MutationRecord>> {
        self.queue_change(EntityKey::recipe(id), operation, data)
    }

    pub fn queue_collection_change(
        &mut self,
        id: &str,
        operation: Operation,
        data: Option<Value>,
    ) -> SyncResult<Option<MutationRecord>> {
        self.queue_change(EntityKey::collection(id), operation, data)
    }

    /// Apply a local edit optimistically and queue it for the remote
    ///
    /// `data` is validated here, once; it is ignored for deletes. Returns the
    /// net queued record, or `None` when the edit cancelled a pending create.
    pub fn queue_change(
        &mut self,
        key: EntityKey,
        operation: Operation,
        data: Option<Value>,
    ) -> SyncResult<Option<MutationRecord>> {
        self.queue_change_at(key, operation, data, Utc::now())
    }

    /// [`queue_change`](Self::queue_change) with an explicit edit time
    pub fn queue_change_at(
        &mut self,
        key: EntityKey,
        operation: Operation,
        data: Option<Value>,
        now: DateTime<Utc>,
    ) -> SyncResult<Option<MutationRecord>> {
        if key.id.trim().is_empty() {
            return Err(ValidationError::EmptyId.into());
        }

        let payload = match (operation, data) {
            (Operation::Delete, _) => None,
            (_, None) => return Err(ValidationError::MissingPayload(operation).into()),
            (_, Some(value)) => Some(Payload::from_json(key.entity_type, value)?),
        };

        let local = match (operation, &payload) {
            (Operation::Create, Some(payload)) => {
                if self.store.get(&key)?.is_some() {
                    return Err(SyncError::AlreadyExists(key));
                }
                Some(Entity::new(key.id.clone(), payload.clone(), now))
            }
            (Operation::Update, Some(payload)) => {
                let existing = self
                    .store
                    .get(&key)?
                    .ok_or_else(|| SyncError::NotFound(key.clone()))?;
                Some(Entity::new(
                    key.id.clone(),
                    existing.payload.overlay(payload)?,
                    now,
                ))
            }
            _ => {
                if self.store.get_version(&key)?.is_none() {
                    return Err(SyncError::NotFound(key));
                }
                None
            }
        };

        let record = MutationRecord::new(key.clone(), operation, payload, now);
        let net = self.write(|store, queue| {
            match &local {
                Some(entity) => store.put(entity)?,
                None => store.delete(&key, now)?,
            }
            let net = queue.enqueue(store, record)?;
            if net.is_none() && !queue.contains_entity(&key) {
                // Created and deleted before the remote ever saw it
                store.purge(&key)?;
            }
            Ok(net)
        })?;

        info!(entity = %key, op = %operation, pending = self.queue.len(), "Queued local change");
        self.publish();
        Ok(net)
    }

    /// Run `f` against the store and queue as one atomic write
    ///
    /// On failure the in-memory queue is reloaded so it matches the rolled
    /// back database.
    fn write<T>(
        &mut self,
        f: impl FnOnce(&LocalStore, &mut MutationQueue) -> StorageResult<T>,
    ) -> SyncResult<T> {
        let result = self.store.atomically(|store| f(store, &mut self.queue));
        if result.is_err() {
            match MutationQueue::load(&self.store, self.config.max_retries) {
                Ok(queue) => self.queue = queue,
                Err(e) => warn!(error = %e, "Failed to reload mutation queue"),
            }
        }
        Ok(result?)
    }

    // ==================== Cycles ====================

    /// Full cycle: pull, then push
    pub async fn sync(&mut self) -> SyncResult<CycleReport> {
        self.run_cycle(Phases::Full).await
    }

    /// Pull phase only
    pub async fn force_pull(&mut self) -> SyncResult<CycleReport> {
        self.run_cycle(Phases::PullOnly).await
    }

    /// Push phase only
    pub async fn force_push(&mut self) -> SyncResult<CycleReport> {
        self.run_cycle(Phases::PushOnly).await
    }

    async fn run_cycle(&mut self, phases: Phases) -> SyncResult<CycleReport> {
        let remote = self.remote.clone().ok_or(SyncError::NoRemote)?;
        if !self.network.is_online() {
            debug!("Offline, skipping sync cycle");
            self.publish();
            return Err(SyncError::Offline);
        }

        let started = Utc::now();
        let mut report = CycleReport::default();
        let mut timeouts = 0usize;
        self.sync_in_progress = true;

        let mut result = Ok(());
        if phases.pulls() {
            result = self.pull_phase(remote.as_ref(), &mut report).await;
        }
        if result.is_ok() && phases.pushes() {
            result = self
                .push_phase(remote.as_ref(), &mut report, &mut timeouts)
                .await;
        }
        if result.is_ok() && timeouts > 0 {
            result = Err(SyncError::Timeout);
        }
        if result.is_ok() && phases == Phases::Full {
            result = self
                .store
                .set_last_sync_time(started)
                .map_err(SyncError::from);
        }

        self.sync_in_progress = false;
        match result {
            Ok(()) => {
                if phases == Phases::Full {
                    self.last_sync_time = Some(started);
                }
                self.cycle_error = None;
                self.transition(SyncState::Idle);
                info!(
                    pulled = report.pulled,
                    pushed = report.pushed,
                    conflicts = report.conflicts,
                    failed = report.failed,
                    "Sync cycle complete"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "Sync cycle failed");
                self.cycle_error = Some(SyncErrorEntry {
                    kind: match e {
                        SyncError::Storage(_) => SyncErrorKind::Storage,
                        SyncError::Rejected(_) => SyncErrorKind::Rejected,
                        _ => SyncErrorKind::Network,
                    },
                    message: e.to_string(),
                    mutation_id: None,
                    entity: None,
                    at: Utc::now(),
                });
                self.transition(SyncState::Error);
                Err(e)
            }
        }
    }

    // ==================== Pull ====================

    async fn pull_phase(
        &mut self,
        remote: &dyn RemoteApi,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        self.transition(SyncState::Pulling);
        let timeout = self.config.request_timeout();
        let mut cursor = self.store.cursor()?;

        loop {
            let page = with_timeout(timeout, remote.pull(cursor.as_deref())).await?;
            debug!(
                changes = page.changes.len(),
                has_more = page.has_more,
                "Pulled page"
            );

            for change in page.changes {
                self.apply_remote_change(change, report)?;
            }

            if let Some(next) = page.next_cursor {
                if cursor.as_deref() != Some(next.as_str()) {
                    self.store.set_cursor(&next)?;
                    cursor = Some(next);
                }
            }
            if !page.has_more {
                break;
            }
        }

        Ok(())
    }

    fn apply_remote_change(&mut self, remote: Entity, report: &mut CycleReport) -> SyncResult<()> {
        let key = remote.key();

        // A parked conflict tracks the newest remote version
        if let Some(index) = self.conflicts.iter().position(|c| c.key() == key) {
            let mut refreshed = self.conflicts[index].clone();
            refreshed.remote_modified_at = remote.modified_at;
            refreshed.remote_version = remote;
            self.write(|store, _| store.upsert_conflict(&refreshed))?;
            debug!(entity = %key, "Refreshed parked conflict");
            self.conflicts[index] = refreshed;
            return Ok(());
        }

        let Some(pending) = self.queue.pending_for(&key).cloned() else {
            self.write(|store, _| store.put_synced(&remote))?;
            report.pulled += 1;
            return Ok(());
        };

        let local = self
            .store
            .get_version(&key)?
            .unwrap_or_else(|| Entity::tombstone(&key, pending.enqueued_at));

        if detect(local.modified_at, remote.modified_at, self.last_sync_time).is_none() {
            // Remote change predates our watermark; the pending edit wins but
            // the remote version becomes the base later merges diff against
            let base = if remote.deleted {
                Payload::empty(key.entity_type)
            } else {
                remote.payload.clone()
            };
            self.write(|store, _| store.put_with_base(&local, &base))?;
            debug!(entity = %key, "Pending local change supersedes remote change");
            return Ok(());
        }

        let base = self.store.base(&key)?;
        let item = ConflictItem::new(local, remote, base, Utc::now());
        self.handle_conflict(item, report)
    }

    // ==================== Push ====================

    async fn push_phase(
        &mut self,
        remote: &dyn RemoteApi,
        report: &mut CycleReport,
        timeouts: &mut usize,
    ) -> SyncResult<()> {
        self.transition(SyncState::Pushing);

        let timeout = self.config.request_timeout();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut resolved: HashSet<EntityKey> = HashSet::new();

        loop {
            let parked: HashSet<EntityKey> = self.conflicts.iter().map(|c| c.key()).collect();
            let batch = self.queue.peek_batch(self.config.batch_size, |key| {
                parked.contains(key)
                    || resolved.contains(key)
                    || self
                        .queue
                        .pending_for(key)
                        .is_some_and(|head| attempted.contains(&head.id))
            });
            if batch.is_empty() {
                break;
            }

            attempted.extend(batch.iter().map(|r| r.id.clone()));
            debug!(records = batch.len(), "Pushing batch");

            match with_timeout(timeout, remote.push(&batch)).await {
                Ok(outcomes) => {
                    self.apply_push_outcomes(&batch, outcomes, &mut resolved, report)?;
                }
                Err(SyncError::Timeout) => {
                    warn!(records = batch.len(), "Push batch timed out, continuing");
                    *timeouts += 1;
                    self.requeue_batch(&batch, "request timed out", report)?;
                }
                Err(e @ SyncError::Rejected(_)) => {
                    // Refused as a whole; records stay queued untouched
                    warn!(error = %e, records = batch.len(), "Push request refused");
                    return Err(e);
                }
                Err(e) => {
                    let message = e.to_string();
                    self.requeue_batch(&batch, &message, report)?;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn requeue_batch(
        &mut self,
        batch: &[MutationRecord],
        error: &str,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        for record in batch {
            let outcome =
                self.write(|store, queue| queue.requeue(store, &record.id, error, Utc::now()))?;
            match outcome {
                RequeueOutcome::Retrying(_) => report.retried += 1,
                RequeueOutcome::Exhausted(_) => report.failed += 1,
                RequeueOutcome::Missing => {}
            }
        }
        Ok(())
    }

    fn apply_push_outcomes(
        &mut self,
        batch: &[MutationRecord],
        outcomes: Vec<PushOutcome>,
        resolved: &mut HashSet<EntityKey>,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let mut by_id: HashMap<String, PushOutcome> = outcomes
            .into_iter()
            .map(|o| (o.mutation_id.clone(), o))
            .collect();

        for record in batch {
            let key = record.key();
            let Some(outcome) = by_id.remove(&record.id) else {
                warn!(mutation_id = %record.id, "No outcome for pushed mutation");
                self.requeue_batch(std::slice::from_ref(record), "missing from push response", report)?;
                continue;
            };

            match (outcome.status, outcome.remote_version) {
                (PushStatus::Accepted, _) => {
                    self.write(|store, queue| {
                        queue.ack(store, &record.id)?;
                        if !queue.contains_entity(&key) {
                            store.mark_synced(&key)?;
                        }
                        Ok(())
                    })?;
                    report.pushed += 1;
                }
                (PushStatus::Rejected, _) => {
                    let reason = outcome
                        .reason
                        .unwrap_or_else(|| "rejected by remote".to_string());
                    self.write(|store, queue| queue.reject(store, &record.id, &reason, Utc::now()))?;
                    report.failed += 1;
                }
                (PushStatus::Conflict, Some(remote_version)) => {
                    let local = self
                        .store
                        .get_version(&key)?
                        .unwrap_or_else(|| Entity::tombstone(&key, record.enqueued_at));
                    let base = self.store.base(&key)?;
                    resolved.insert(key);
                    let item = ConflictItem::new(local, remote_version, base, Utc::now());
                    self.handle_conflict(item, report)?;
                }
                (PushStatus::Conflict, None) => {
                    self.requeue_batch(
                        std::slice::from_ref(record),
                        "conflict reported without a remote version",
                        report,
                    )?;
                }
            }
        }

        Ok(())
    }

    // ==================== Conflicts ====================

    fn handle_conflict(&mut self, item: ConflictItem, report: &mut CycleReport) -> SyncResult<()> {
        let resume = self.state;
        self.transition(SyncState::ResolvingConflicts);
        report.conflicts += 1;

        let key = item.key();
        match Resolution::for_strategy(self.config.conflict_resolution) {
            Some(resolution) => {
                let plan = resolver::plan(
                    resolution,
                    &item,
                    self.queue.pending_for(&key),
                    Utc::now(),
                )?;
                self.write(|store, queue| apply_plan(store, queue, &plan))?;
                info!(entity = %key, %resolution, "Resolved conflict");
            }
            None => {
                self.write(|store, _| store.upsert_conflict(&item))?;
                info!(entity = %key, conflict_id = %item.id, "Conflict parked for manual resolution");
                self.conflicts.push(item);
                report.parked += 1;
            }
        }

        self.transition(resume);
        Ok(())
    }

    /// Settle a parked conflict
    ///
    /// A `merged_payload` is taken as the outcome itself; fields it leaves
    /// unset keep their remote value. Otherwise `resolution` decides.
    pub fn resolve_conflict(
        &mut self,
        id: &str,
        resolution: Resolution,
        merged_payload: Option<Value>,
    ) -> SyncResult<()> {
        let index = self
            .conflicts
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| SyncError::ConflictNotFound(id.to_string()))?;
        let item = self.conflicts[index].clone();
        let key = item.key();
        let now = Utc::now();

        let plan = match merged_payload {
            Some(value) => {
                let payload = Payload::from_json(item.entity_type, value)?;
                resolver::plan_with_payload(&item, payload, now)?
            }
            None => resolver::plan(resolution, &item, self.queue.pending_for(&key), now)?,
        };

        self.write(|store, queue| {
            apply_plan(store, queue, &plan)?;
            store.delete_conflict(&item.id)
        })?;
        self.conflicts.remove(index);

        info!(entity = %key, conflict_id = id, %resolution, "Conflict resolved");
        self.publish();
        Ok(())
    }

    /// Settle every parked conflict the same way; returns how many
    pub fn resolve_all_conflicts(&mut self, resolution: Resolution) -> SyncResult<usize> {
        let ids: Vec<String> = self.conflicts.iter().map(|c| c.id.clone()).collect();
        for id in &ids {
            self.resolve_conflict(id, resolution, None)?;
        }
        Ok(ids.len())
    }

    // ==================== Maintenance ====================

    /// Apply a partial config update; the old config stays on error
    pub fn update_config(&mut self, patch: &SyncConfigPatch) -> SyncResult<SyncConfig> {
        self.config.apply(patch)?;
        self.queue.set_max_retries(self.config.max_retries);
        info!(?patch, "Sync config updated");
        self.publish();
        Ok(self.config.clone())
    }

    /// Drop every pending mutation; local data is left as it is
    pub fn clear_queue(&mut self) -> SyncResult<usize> {
        let dropped = self.write(|store, queue| queue.clear(store))?;
        warn!(dropped, "Mutation queue cleared");
        self.publish();
        Ok(dropped)
    }

    /// Forget failed mutations and the last cycle error
    pub fn clear_errors(&mut self) -> SyncResult<usize> {
        let dropped = self.write(|store, queue| queue.clear_failed(store))?;
        self.cycle_error = None;
        if self.state == SyncState::Error {
            self.transition(SyncState::Idle);
        } else {
            self.publish();
        }
        Ok(dropped)
    }

    /// All live entities of a type
    pub fn list(&self, entity_type: EntityType) -> SyncResult<Vec<Entity>> {
        Ok(self.store.list(entity_type)?)
    }
}

/// Bound a remote call by the per-request timeout
async fn with_timeout<T>(
    timeout: Duration,
    request: impl Future<Output = Result<T, RemoteError>>,
) -> SyncResult<T> {
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result.map_err(SyncError::from),
        Err(_) => Err(SyncError::Timeout),
    }
}

fn apply_plan(
    store: &LocalStore,
    queue: &mut MutationQueue,
    plan: &ResolutionPlan,
) -> StorageResult<()> {
    match &plan.store {
        StoreWrite::Keep => {}
        StoreWrite::Synced(entity) => store.put_synced(entity)?,
        StoreWrite::Merged { entity, base } => store.put_with_base(entity, base)?,
    }
    match &plan.queue {
        QueueAction::Discard => {
            queue.discard_entity(store, &plan.key)?;
        }
        QueueAction::Replace(record) => {
            queue.replace_entity(store, record.clone())?;
        }
    }
    Ok(())
}

fn failed_entry(failed: &FailedMutation) -> SyncErrorEntry {
    SyncErrorEntry {
        kind: match failed.kind {
            FailureKind::Rejected => SyncErrorKind::Rejected,
            FailureKind::RetriesExhausted => SyncErrorKind::RetriesExhausted,
        },
        message: failed.reason.clone(),
        mutation_id: Some(failed.record.id.clone()),
        entity: Some(failed.record.key().to_string()),
        at: failed.failed_at,
    }
}
