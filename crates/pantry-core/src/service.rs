//! Sync service
//!
//! Runs a [`SyncEngine`] on its own tokio task. Every operation reaches the
//! engine as a command on one channel, so local edits, cycles, resolutions
//! and queue maintenance never interleave: a command sent while a cycle is
//! in flight waits until the cycle completes.
//!
//! The task also hosts the scheduler. Cycles start when:
//! - the interval timer (or retry backoff) expires while online
//! - connectivity goes from offline to online
//! - [`SyncHandle::force_sync`] is called, which also restarts the timer
//!
//! ## Usage
//!
//! ```ignore
//! let engine = SyncEngine::open(&config, Arc::new(NetworkMonitor::new(true)))?;
//! let handle = spawn_sync_service(engine);
//!
//! handle.queue_recipe_change("recipe-1", Operation::Update, Some(json!({"name": "X"}))).await?;
//! let report = handle.force_sync().await?;
//! handle.shutdown().await;
//! ```

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{SyncConfig, SyncConfigPatch};
use crate::conflict::ConflictItem;
use crate::engine::{CycleReport, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::models::{Entity, EntityKey, EntityType, Operation};
use crate::network::NetworkMonitor;
use crate::queue::MutationRecord;
use crate::resolver::Resolution;
use crate::scheduler::{SyncScheduler, SyncTrigger};
use crate::status::{StatusBroadcaster, Subscription, SyncStatus};

type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// Commands sent to the sync task
#[derive(Debug)]
pub enum SyncCommand {
    QueueChange {
        key: EntityKey,
        operation: Operation,
        data: Option<Value>,
        reply: Reply<Option<MutationRecord>>,
    },
    Sync {
        reply: Reply<CycleReport>,
    },
    Pull {
        reply: Reply<CycleReport>,
    },
    Push {
        reply: Reply<CycleReport>,
    },
    GetConflicts {
        reply: Reply<Vec<ConflictItem>>,
    },
    ResolveConflict {
        id: String,
        resolution: Resolution,
        merged_payload: Option<Value>,
        reply: Reply<()>,
    },
    ResolveAll {
        resolution: Resolution,
        reply: Reply<usize>,
    },
    UpdateConfig {
        patch: SyncConfigPatch,
        reply: Reply<SyncConfig>,
    },
    ClearQueue {
        reply: Reply<usize>,
    },
    ClearErrors {
        reply: Reply<usize>,
    },
    Get {
        key: EntityKey,
        reply: Reply<Option<Entity>>,
    },
    List {
        entity_type: EntityType,
        reply: Reply<Vec<Entity>>,
    },
    /// Stop the task
    Shutdown,
}

/// Handle to a running sync service
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    status_rx: watch::Receiver<SyncStatus>,
    broadcaster: StatusBroadcaster,
    network: Arc<NetworkMonitor>,
    task: JoinHandle<()>,
}

/// Spawn the sync task around an engine
pub fn spawn_sync_service(engine: SyncEngine) -> SyncHandle {
    let (command_tx, command_rx) = mpsc::channel(32);
    let broadcaster = engine.broadcaster().clone();
    let status_rx = broadcaster.subscribe();
    let network = Arc::clone(engine.network());

    let task = tokio::spawn(service_loop(engine, command_rx));

    SyncHandle {
        command_tx,
        status_rx,
        broadcaster,
        network,
        task,
    }
}

impl SyncHandle {
    /// Latest status snapshot
    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver updated with every snapshot
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.broadcaster.add_listener(listener)
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        self.broadcaster.remove_listener(id)
    }

    /// Report connectivity; going online triggers a cycle
    pub fn set_online(&self, online: bool) {
        self.network.set_online(online);
    }

    pub async fn queue_recipe_change(
        &self,
        id: &str,
        operation: Operation,
        data: Option<Value>,
    ) -> SyncResult<Option<MutationRecord>> {
        self.queue_change(EntityKey::recipe(id), operation, data)
            .await
    }

    pub async fn queue_collection_change(
        &self,
        id: &str,
        operation: Operation,
        data: Option<Value>,
    ) -> SyncResult<Option<MutationRecord>> {
        self.queue_change(EntityKey::collection(id), operation, data)
            .await
    }

    pub async fn queue_change(
        &self,
        key: EntityKey,
        operation: Operation,
        data: Option<Value>,
    ) -> SyncResult<Option<MutationRecord>> {
        self.request(|reply| SyncCommand::QueueChange {
            key,
            operation,
            data,
            reply,
        })
        .await
    }

    /// Run a full cycle now
    pub async fn force_sync(&self) -> SyncResult<CycleReport> {
        self.request(|reply| SyncCommand::Sync { reply }).await
    }

    pub async fn force_pull(&self) -> SyncResult<CycleReport> {
        self.request(|reply| SyncCommand::Pull { reply }).await
    }

    pub async fn force_push(&self) -> SyncResult<CycleReport> {
        self.request(|reply| SyncCommand::Push { reply }).await
    }

    pub async fn get_conflicts(&self) -> SyncResult<Vec<ConflictItem>> {
        self.request(|reply| SyncCommand::GetConflicts { reply })
            .await
    }

    pub async fn resolve_conflict(
        &self,
        id: &str,
        resolution: Resolution,
        merged_payload: Option<Value>,
    ) -> SyncResult<()> {
        let id = id.to_string();
        self.request(|reply| SyncCommand::ResolveConflict {
            id,
            resolution,
            merged_payload,
            reply,
        })
        .await
    }

    pub async fn resolve_all_conflicts(&self, resolution: Resolution) -> SyncResult<usize> {
        self.request(|reply| SyncCommand::ResolveAll { resolution, reply })
            .await
    }

    pub async fn update_config(&self, patch: SyncConfigPatch) -> SyncResult<SyncConfig> {
        self.request(|reply| SyncCommand::UpdateConfig { patch, reply })
            .await
    }

    pub async fn clear_queue(&self) -> SyncResult<usize> {
        self.request(|reply| SyncCommand::ClearQueue { reply }).await
    }

    pub async fn clear_errors(&self) -> SyncResult<usize> {
        self.request(|reply| SyncCommand::ClearErrors { reply })
            .await
    }

    pub async fn get(&self, key: EntityKey) -> SyncResult<Option<Entity>> {
        self.request(|reply| SyncCommand::Get { key, reply }).await
    }

    pub async fn list(&self, entity_type: EntityType) -> SyncResult<Vec<Entity>> {
        self.request(|reply| SyncCommand::List { entity_type, reply })
            .await
    }

    /// Stop the task once queued commands are handled
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sync task ended abnormally");
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> SyncCommand,
    ) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| SyncError::ServiceStopped)?;
        response.await.map_err(|_| SyncError::ServiceStopped)?
    }
}

/// Main task loop
async fn service_loop(mut engine: SyncEngine, mut command_rx: mpsc::Receiver<SyncCommand>) {
    let mut scheduler = SyncScheduler::new(engine.config(), Instant::now());
    let mut online_rx = engine.network().subscribe();
    let mut was_online = *online_rx.borrow_and_update();

    info!(online = was_online, "Sync service started");
    engine.publish();

    loop {
        let due = scheduler.next_due();

        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SyncCommand::Shutdown) | None => break,
                    Some(cmd) => handle_command(&mut engine, &mut scheduler, cmd).await,
                }
            }
            _ = sleep_until(due) => {
                if engine.network().is_online() {
                    let _ = run_cycle(&mut engine, &mut scheduler, SyncTrigger::Timer).await;
                } else {
                    debug!("Timer fired while offline, skipping");
                    scheduler.skip(Instant::now());
                }
            }
            Ok(()) = online_rx.changed() => {
                let online = *online_rx.borrow_and_update();
                engine.publish();
                if online && !was_online {
                    let _ = run_cycle(&mut engine, &mut scheduler, SyncTrigger::Reconnect).await;
                }
                was_online = online;
            }
        }
    }

    info!("Sync service stopped");
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

async fn run_cycle(
    engine: &mut SyncEngine,
    scheduler: &mut SyncScheduler,
    trigger: SyncTrigger,
) -> SyncResult<CycleReport> {
    debug!(%trigger, "Sync cycle triggered");
    let result = engine.sync().await;

    let now = Instant::now();
    match &result {
        Ok(_) => scheduler.record_success(now),
        Err(SyncError::NoRemote) => scheduler.skip(now),
        Err(e) => {
            let delay = scheduler.record_failure(now);
            warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Sync cycle will be retried");
        }
    }
    result
}

async fn handle_command(
    engine: &mut SyncEngine,
    scheduler: &mut SyncScheduler,
    cmd: SyncCommand,
) {
    // A dropped reply receiver only means the caller stopped waiting
    match cmd {
        SyncCommand::QueueChange {
            key,
            operation,
            data,
            reply,
        } => {
            let _ = reply.send(engine.queue_change(key, operation, data));
        }
        SyncCommand::Sync { reply } => {
            let result = run_cycle(engine, scheduler, SyncTrigger::Manual).await;
            let _ = reply.send(result);
        }
        SyncCommand::Pull { reply } => {
            let _ = reply.send(engine.force_pull().await);
        }
        SyncCommand::Push { reply } => {
            let _ = reply.send(engine.force_push().await);
        }
        SyncCommand::GetConflicts { reply } => {
            let _ = reply.send(Ok(engine.conflicts().to_vec()));
        }
        SyncCommand::ResolveConflict {
            id,
            resolution,
            merged_payload,
            reply,
        } => {
            let _ = reply.send(engine.resolve_conflict(&id, resolution, merged_payload));
        }
        SyncCommand::ResolveAll { resolution, reply } => {
            let _ = reply.send(engine.resolve_all_conflicts(resolution));
        }
        SyncCommand::UpdateConfig { patch, reply } => {
            let result = engine.update_config(&patch);
            if let Ok(config) = &result {
                scheduler.configure(config, Instant::now());
            }
            let _ = reply.send(result);
        }
        SyncCommand::ClearQueue { reply } => {
            let _ = reply.send(engine.clear_queue());
        }
        SyncCommand::ClearErrors { reply } => {
            let _ = reply.send(engine.clear_errors());
        }
        SyncCommand::Get { key, reply } => {
            let _ = reply.send(engine.store().get(&key).map_err(SyncError::from));
        }
        SyncCommand::List { entity_type, reply } => {
            let _ = reply.send(engine.list(entity_type));
        }
        SyncCommand::Shutdown => {}
    }
}
