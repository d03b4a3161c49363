//! Shared helpers for pantry-core integration tests
//!
//! Provides:
//! - `ScriptedRemote`, an in-memory remote service with scripted failures
//! - Builders for engines backed by a store in a temp dir

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tempfile::TempDir;

use pantry_core::{
    Entity, EntityKey, LocalStore, MutationRecord, NetworkMonitor, Operation, Payload, PullPage,
    PushOutcome, RemoteApi, RemoteError, SyncConfig, SyncEngine,
};

/// Timestamp `ms` milliseconds after the epoch
pub fn at(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

pub fn recipe(id: &str, fields: Value, modified_ms: i64) -> Entity {
    let key = EntityKey::recipe(id);
    Entity::new(
        id,
        Payload::from_json(key.entity_type, fields).unwrap(),
        at(modified_ms),
    )
}

pub fn collection(id: &str, fields: Value, modified_ms: i64) -> Entity {
    let key = EntityKey::collection(id);
    Entity::new(
        id,
        Payload::from_json(key.entity_type, fields).unwrap(),
        at(modified_ms),
    )
}

/// Scripted per-entity verdict for the next push of that entity
#[derive(Debug, Clone)]
pub enum Verdict {
    Reject(String),
    Conflict,
}

#[derive(Default)]
struct RemoteState {
    entities: HashMap<EntityKey, Entity>,
    /// Change feed; a cursor is an index into it
    feed: Vec<Entity>,
    page_size: Option<usize>,
    push_calls: Vec<Vec<MutationRecord>>,
    pull_calls: Vec<Option<String>>,
    push_failures: VecDeque<RemoteError>,
    pull_failures: VecDeque<RemoteError>,
    verdicts: HashMap<EntityKey, Verdict>,
    push_delay: Option<Duration>,
}

/// In-memory stand-in for the remote sync service
///
/// Accepts every pushed record unless told otherwise, applies it to its own
/// copy of the data and appends the result to the change feed.
#[derive(Default)]
pub struct ScriptedRemote {
    state: Mutex<RemoteState>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    /// An edit made on another device
    pub fn remote_edit(&self, entity: Entity) {
        let mut state = self.state();
        state.entities.insert(entity.key(), entity.clone());
        state.feed.push(entity);
    }

    /// Cursor pointing past everything currently in the feed
    pub fn cursor(&self) -> String {
        self.state().feed.len().to_string()
    }

    pub fn entity(&self, key: &EntityKey) -> Option<Entity> {
        self.state().entities.get(key).cloned()
    }

    pub fn set_page_size(&self, size: usize) {
        self.state().page_size = Some(size);
    }

    pub fn fail_push(&self, error: RemoteError) {
        self.state().push_failures.push_back(error);
    }

    pub fn fail_pull(&self, error: RemoteError) {
        self.state().pull_failures.push_back(error);
    }

    pub fn verdict(&self, key: EntityKey, verdict: Verdict) {
        self.state().verdicts.insert(key, verdict);
    }

    /// Delay the next push call
    pub fn delay_next_push(&self, delay: Duration) {
        self.state().push_delay = Some(delay);
    }

    pub fn push_calls(&self) -> Vec<Vec<MutationRecord>> {
        self.state().push_calls.clone()
    }

    /// Every record pushed so far, in order
    pub fn pushed(&self) -> Vec<MutationRecord> {
        self.state().push_calls.iter().flatten().cloned().collect()
    }

    pub fn pull_calls(&self) -> Vec<Option<String>> {
        self.state().pull_calls.clone()
    }

    fn apply(state: &mut RemoteState, record: &MutationRecord) -> PushOutcome {
        let key = record.key();
        match state.verdicts.remove(&key) {
            Some(Verdict::Reject(reason)) => return PushOutcome::rejected(&record.id, reason),
            Some(Verdict::Conflict) => {
                if let Some(current) = state.entities.get(&key) {
                    return PushOutcome::conflict(&record.id, current.clone());
                }
            }
            None => {}
        }

        let now = Utc::now();
        let next = match (record.operation, &record.payload) {
            (Operation::Delete, _) | (_, None) => Entity::tombstone(&key, now),
            (Operation::Create, Some(payload)) => Entity::new(&key.id, payload.clone(), now),
            (Operation::Update, Some(payload)) => {
                let merged = match state.entities.get(&key) {
                    Some(current) if !current.deleted => current.payload.overlay(payload).unwrap(),
                    _ => payload.clone(),
                };
                Entity::new(&key.id, merged, now)
            }
        };
        state.entities.insert(key, next.clone());
        state.feed.push(next);
        PushOutcome::accepted(&record.id)
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    async fn push(&self, batch: &[MutationRecord]) -> Result<Vec<PushOutcome>, RemoteError> {
        let delay = {
            let mut state = self.state();
            state.push_calls.push(batch.to_vec());
            state.push_delay.take()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(error) = state.push_failures.pop_front() {
            return Err(error);
        }
        Ok(batch.iter().map(|r| Self::apply(&mut state, r)).collect())
    }

    async fn pull(&self, since: Option<&str>) -> Result<PullPage, RemoteError> {
        let mut state = self.state();
        state.pull_calls.push(since.map(str::to_string));
        if let Some(error) = state.pull_failures.pop_front() {
            return Err(error);
        }

        let start: usize = since.map(|s| s.parse().unwrap()).unwrap_or(0);
        let end = match state.page_size {
            Some(size) => (start + size).min(state.feed.len()),
            None => state.feed.len(),
        };
        Ok(PullPage {
            changes: state.feed[start..end].to_vec(),
            next_cursor: Some(end.to_string()),
            has_more: end < state.feed.len(),
        })
    }
}

/// Sync settings suited to tests: manual cycles only
pub fn test_config() -> SyncConfig {
    SyncConfig {
        auto_sync_enabled: false,
        ..SyncConfig::default()
    }
}

pub fn open_store(dir: &Path) -> LocalStore {
    LocalStore::open_path(&dir.join("pantry.db")).unwrap()
}

/// Engine over the store in `dir`
pub fn engine_at(
    dir: &Path,
    config: SyncConfig,
    remote: &Arc<ScriptedRemote>,
    online: bool,
) -> SyncEngine {
    SyncEngine::new(
        open_store(dir),
        config,
        Some(Arc::clone(remote) as Arc<dyn RemoteApi>),
        Arc::new(NetworkMonitor::new(online)),
    )
    .unwrap()
}

/// Fresh temp dir, remote and online engine
pub fn setup(config: SyncConfig) -> (TempDir, Arc<ScriptedRemote>, SyncEngine) {
    let dir = TempDir::new().unwrap();
    let remote = ScriptedRemote::new();
    let engine = engine_at(dir.path(), config, &remote, true);
    (dir, remote, engine)
}

/// Record `entity` as known to both sides, as after an earlier sync
///
/// Must be called before the engine over `dir` is built.
pub fn seed_synced(dir: &Path, remote: &ScriptedRemote, entity: Entity, last_sync_ms: i64) {
    remote.remote_edit(entity.clone());
    let store = open_store(dir);
    store.put_synced(&entity).unwrap();
    store.set_cursor(&remote.cursor()).unwrap();
    store.set_last_sync_time(at(last_sync_ms)).unwrap();
}
