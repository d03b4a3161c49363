//! Mutation queue
//!
//! Ordered log of pending local edits, persisted through the [`LocalStore`].
//! Edits to the same entity coalesce into their net effect:
//!
//! | queued   | incoming | result                       |
//! |----------|----------|------------------------------|
//! | Update   | Update   | Update, newest value per field |
//! | Update   | Delete   | Delete                       |
//! | Create   | Update   | Create, fields overlaid      |
//! | Create   | Delete   | nothing (both removed)       |
//! | Delete   | Delete   | Delete                       |
//! | Delete   | Create   | both kept, in order          |
//!
//! Records leave the queue on acknowledgement, on supersession by
//! coalescing, or when they fail for good; failures land in the failed list
//! and are never dropped silently.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{EntityKey, EntityType, Operation, Payload};
use crate::storage::StorageResult;
use crate::store::LocalStore;

/// A pending local edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    /// Fields to write (absent for deletes)
    pub payload: Option<Payload>,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Remote version this edit was made against, when known
    #[serde(default)]
    pub based_on: Option<DateTime<Utc>>,
}

impl MutationRecord {
    pub fn new(
        key: EntityKey,
        operation: Operation,
        payload: Option<Payload>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_type: key.entity_type,
            entity_id: key.id,
            operation,
            payload,
            enqueued_at,
            attempt_count: 0,
            last_error: None,
            based_on: None,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    fn is_for(&self, key: &EntityKey) -> bool {
        self.entity_type == key.entity_type && self.entity_id == key.id
    }
}

/// Why a mutation left the queue without being accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The remote refused it (not retried)
    Rejected,
    /// Transient failures exceeded the retry budget
    RetriesExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Rejected => "rejected",
            FailureKind::RetriesExhausted => "retries_exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rejected" => Some(FailureKind::Rejected),
            "retries_exhausted" => Some(FailureKind::RetriesExhausted),
            _ => None,
        }
    }
}

/// A mutation moved to the error list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMutation {
    pub record: MutationRecord,
    pub reason: String,
    pub kind: FailureKind,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of [`MutationQueue::requeue`]
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    /// Still queued, with the new attempt count
    Retrying(u32),
    /// Moved to the failed list
    Exhausted(FailedMutation),
    /// No record with that id
    Missing,
}

/// How an incoming edit combines with the queued one
enum Coalesced {
    /// Queued record rewritten in place
    Replace(MutationRecord),
    /// Both cancel out
    Remove,
    /// Incoming is queued behind the existing record
    Append,
}

/// Ordered, coalescing queue of pending mutations
pub struct MutationQueue {
    records: Vec<MutationRecord>,
    failed: Vec<FailedMutation>,
    max_retries: u32,
}

impl MutationQueue {
    /// Load the persisted queue and failed list
    pub fn load(store: &LocalStore, max_retries: u32) -> StorageResult<Self> {
        Ok(Self {
            records: store.load_mutations()?,
            failed: store.load_failed()?,
            max_retries,
        })
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Active records in queue order
    pub fn records(&self) -> &[MutationRecord] {
        &self.records
    }

    /// Mutations that will not be retried
    pub fn failed(&self) -> &[FailedMutation] {
        &self.failed
    }

    pub fn get(&self, id: &str) -> Option<&MutationRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// The oldest pending record for an entity
    pub fn pending_for(&self, key: &EntityKey) -> Option<&MutationRecord> {
        self.records.iter().find(|r| r.is_for(key))
    }

    pub fn contains_entity(&self, key: &EntityKey) -> bool {
        self.pending_for(key).is_some()
    }

    /// Queue an edit, coalescing with the latest record for the same entity
    ///
    /// Returns the resulting net record, or `None` when the edit cancelled
    /// the queued one out.
    pub fn enqueue(
        &mut self,
        store: &LocalStore,
        record: MutationRecord,
    ) -> StorageResult<Option<MutationRecord>> {
        let key = record.key();
        let tail = self.records.iter().rposition(|r| r.is_for(&key));

        let Some(index) = tail else {
            store.insert_mutation(&record)?;
            debug!(mutation_id = %record.id, entity = %key, op = %record.operation, "Queued mutation");
            self.records.push(record.clone());
            return Ok(Some(record));
        };

        match coalesce(&self.records[index], &record) {
            Coalesced::Replace(merged) => {
                store.update_mutation(&merged)?;
                debug!(mutation_id = %merged.id, entity = %key, op = %merged.operation, "Coalesced mutation");
                self.records[index] = merged.clone();
                Ok(Some(merged))
            }
            Coalesced::Remove => {
                let removed = self.records.remove(index);
                store.delete_mutation(&removed.id)?;
                debug!(mutation_id = %removed.id, entity = %key, "Create and delete cancelled out");
                Ok(None)
            }
            Coalesced::Append => {
                store.insert_mutation(&record)?;
                debug!(mutation_id = %record.id, entity = %key, op = %record.operation, "Queued mutation");
                self.records.push(record.clone());
                Ok(Some(record))
            }
        }
    }

    /// Up to `n` records in queue order, at most one per entity
    ///
    /// Only the oldest record of an entity is eligible, so per-entity order
    /// holds across batches. Entities for which `skip` returns true are
    /// left out entirely.
    pub fn peek_batch<F>(&self, n: usize, skip: F) -> Vec<MutationRecord>
    where
        F: Fn(&EntityKey) -> bool,
    {
        let mut seen: HashSet<EntityKey> = HashSet::new();
        let mut batch = Vec::new();

        for record in &self.records {
            if batch.len() >= n {
                break;
            }
            let key = record.key();
            if !seen.insert(key.clone()) || skip(&key) {
                continue;
            }
            batch.push(record.clone());
        }

        batch
    }

    /// Remove a record the remote accepted
    pub fn ack(&mut self, store: &LocalStore, id: &str) -> StorageResult<Option<MutationRecord>> {
        let Some(index) = self.records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        store.delete_mutation(id)?;
        Ok(Some(self.records.remove(index)))
    }

    /// Count a failed attempt
    ///
    /// Once the attempt count exceeds the retry budget the record moves to
    /// the failed list. Only that mutation is affected.
    pub fn requeue(
        &mut self,
        store: &LocalStore,
        id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<RequeueOutcome> {
        let Some(index) = self.records.iter().position(|r| r.id == id) else {
            return Ok(RequeueOutcome::Missing);
        };

        let record = &mut self.records[index];
        record.attempt_count += 1;
        record.last_error = Some(error.to_string());

        if record.attempt_count <= self.max_retries {
            store.update_mutation(record)?;
            return Ok(RequeueOutcome::Retrying(record.attempt_count));
        }

        warn!(
            mutation_id = %record.id,
            attempts = record.attempt_count,
            "Mutation exceeded retry budget, moving to error list"
        );
        let failed = self.fail_at(store, index, error, FailureKind::RetriesExhausted, at)?;
        Ok(RequeueOutcome::Exhausted(failed))
    }

    /// Move a record the remote refused straight to the failed list
    pub fn reject(
        &mut self,
        store: &LocalStore,
        id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<FailedMutation>> {
        let Some(index) = self.records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        warn!(mutation_id = %id, reason, "Mutation rejected by remote");
        self.fail_at(store, index, reason, FailureKind::Rejected, at)
            .map(Some)
    }

    fn fail_at(
        &mut self,
        store: &LocalStore,
        index: usize,
        reason: &str,
        kind: FailureKind,
        at: DateTime<Utc>,
    ) -> StorageResult<FailedMutation> {
        let failed = FailedMutation {
            record: self.records[index].clone(),
            reason: reason.to_string(),
            kind,
            failed_at: at,
        };
        store.insert_failed(&failed)?;
        store.delete_mutation(&failed.record.id)?;
        self.records.remove(index);
        self.failed.push(failed.clone());
        Ok(failed)
    }

    /// Drop every pending record for an entity
    pub fn discard_entity(
        &mut self,
        store: &LocalStore,
        key: &EntityKey,
    ) -> StorageResult<Vec<MutationRecord>> {
        let (discarded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| r.is_for(key));
        self.records = kept;

        for record in &discarded {
            if let Err(e) = store.delete_mutation(&record.id) {
                // Keep memory and disk in step when the delete fails midway
                self.records.push(record.clone());
                return Err(e);
            }
        }
        Ok(discarded)
    }

    /// Replace whatever is pending for the record's entity with `record`
    pub fn replace_entity(
        &mut self,
        store: &LocalStore,
        record: MutationRecord,
    ) -> StorageResult<MutationRecord> {
        self.discard_entity(store, &record.key())?;
        store.insert_mutation(&record)?;
        self.records.push(record.clone());
        Ok(record)
    }

    /// Empty the active queue; returns how many records were dropped
    pub fn clear(&mut self, store: &LocalStore) -> StorageResult<usize> {
        store.clear_mutations()?;
        let dropped = self.records.len();
        self.records.clear();
        Ok(dropped)
    }

    /// Empty the failed list
    pub fn clear_failed(&mut self, store: &LocalStore) -> StorageResult<usize> {
        store.clear_failed()?;
        let dropped = self.failed.len();
        self.failed.clear();
        Ok(dropped)
    }
}

fn coalesce(queued: &MutationRecord, incoming: &MutationRecord) -> Coalesced {
    use Operation::*;

    let mut merged = queued.clone();
    match (queued.operation, incoming.operation) {
        (Create, Delete) => Coalesced::Remove,
        (Delete, Create) | (Delete, Update) => Coalesced::Append,
        (Delete, Delete) => Coalesced::Replace(merged),
        (Update, Delete) => {
            merged.operation = Delete;
            merged.payload = None;
            Coalesced::Replace(merged)
        }
        (Create, Create) | (Create, Update) | (Update, Update) | (Update, Create) => {
            merged.payload = overlay(queued.payload.as_ref(), incoming.payload.as_ref());
            Coalesced::Replace(merged)
        }
    }
}

fn overlay(older: Option<&Payload>, newer: Option<&Payload>) -> Option<Payload> {
    match (older, newer) {
        (Some(older), Some(newer)) => older.overlay(newer).ok().or_else(|| Some(newer.clone())),
        (None, newer) => newer.cloned(),
        (older, None) => older.cloned(),
    }
}
