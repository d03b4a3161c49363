//! Sync status and the listener registry
//!
//! [`SyncStatus`] is an immutable snapshot built by the engine after every
//! state transition. It is always derived from the queue, the conflict list
//! and the last cycle outcome; nothing mutates it in place.
//!
//! [`StatusBroadcaster`] delivers snapshots to registered callbacks and to
//! `watch` receivers. Callbacks get a shared reference only; to act on a
//! status they must go back through the sync handle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Pulling,
    Pushing,
    ResolvingConflicts,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pulling => "pulling",
            SyncState::Pushing => "pushing",
            SyncState::ResolvingConflicts => "resolving_conflicts",
            SyncState::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a surfaced error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Last cycle failed transiently; it will be retried
    Network,
    /// Local persistence failed during the last cycle
    Storage,
    /// A mutation the remote refused
    Rejected,
    /// A mutation that ran out of retries
    RetriesExhausted,
}

/// One entry of `SyncStatus::errors`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub kind: SyncErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub at: DateTime<Utc>,
}

/// Snapshot of the sync engine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_changes: usize,
    pub sync_in_progress: bool,
    pub errors: Vec<SyncErrorEntry>,
    pub state: SyncState,
    /// Conflicts waiting for a manual decision
    pub conflicts: usize,
}

/// What to tell the user, derived from a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSummary {
    Synced,
    Pending(usize),
    OfflinePending(usize),
    Error,
    NeedsResolution(usize),
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusSummary::Synced => write!(f, "All changes synced"),
            StatusSummary::Pending(n) => write!(f, "{} change(s) waiting to sync", n),
            StatusSummary::OfflinePending(n) => write!(f, "Offline, {} change(s) pending", n),
            StatusSummary::Error => write!(f, "Sync error"),
            StatusSummary::NeedsResolution(n) => write!(f, "{} conflict(s) need resolution", n),
        }
    }
}

impl SyncStatus {
    pub fn summary(&self) -> StatusSummary {
        if self.conflicts > 0 {
            StatusSummary::NeedsResolution(self.conflicts)
        } else if self.state == SyncState::Error || !self.errors.is_empty() {
            StatusSummary::Error
        } else if !self.is_online {
            StatusSummary::OfflinePending(self.pending_changes)
        } else if self.pending_changes > 0 {
            StatusSummary::Pending(self.pending_changes)
        } else {
            StatusSummary::Synced
        }
    }
}

type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
    watch: watch::Sender<SyncStatus>,
}

impl Registry {
    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
        // A panicking listener must not take the registry down with it
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

/// Listener registry owned by one engine
#[derive(Clone)]
pub struct StatusBroadcaster {
    registry: Arc<Registry>,
}

impl StatusBroadcaster {
    pub fn new(initial: SyncStatus) -> Self {
        let (watch, _) = watch::channel(initial);
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
                watch,
            }),
        }
    }

    /// Register a callback; it receives every snapshot published from now on
    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.listeners().push((id, Arc::new(listener)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Unregister by id; returns false if it was not registered
    pub fn remove_listener(&self, id: u64) -> bool {
        self.registry.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.registry.listeners().len()
    }

    /// Receiver that always holds the latest snapshot
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.registry.watch.subscribe()
    }

    pub fn latest(&self) -> SyncStatus {
        self.registry.watch.borrow().clone()
    }

    /// Deliver a snapshot to every listener
    pub fn publish(&self, status: SyncStatus) {
        // Call outside the lock so listeners may (un)subscribe
        let listeners: Vec<Listener> = self
            .registry
            .listeners()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in &listeners {
            listener(&status);
        }
        self.registry.watch.send_replace(status);
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(SyncStatus::default())
    }
}

/// Handle returned by [`StatusBroadcaster::add_listener`]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving snapshots
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}
