//! Conflict resolution
//!
//! Turns a [`ConflictItem`] and a chosen [`Resolution`] into a
//! [`ResolutionPlan`]: one write to the local store and one action on the
//! entity's queued mutations. Planning is pure; the engine applies the plan.
//!
//! Merge is last-writer-wins per field:
//! - start from the remote version
//! - fields only the local side changed take the local value
//! - fields both sides changed take the value of the later version, with
//!   ties going to the remote
//!
//! When either side is a deletion there are no fields to merge and the later
//! version wins the whole record.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConflictStrategy;
use crate::conflict::ConflictItem;
use crate::models::{Entity, EntityKey, Operation, Payload, ValidationError};
use crate::queue::MutationRecord;

/// How a conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Local,
    Remote,
    Merge,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merge => "merge",
        }
    }

    /// Resolution applied automatically for a strategy (`None` for manual)
    pub fn for_strategy(strategy: ConflictStrategy) -> Option<Self> {
        match strategy {
            ConflictStrategy::Local => Some(Resolution::Local),
            ConflictStrategy::Remote => Some(Resolution::Remote),
            ConflictStrategy::Merge => Some(Resolution::Merge),
            ConflictStrategy::Manual => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Resolution::Local),
            "remote" => Ok(Resolution::Remote),
            "merge" => Ok(Resolution::Merge),
            other => Err(format!(
                "unknown resolution '{other}' (expected local, remote or merge)"
            )),
        }
    }
}

/// What happens to the local store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    /// The local version stays as it is
    Keep,
    /// The remote version replaces the local one and becomes the base
    Synced(Entity),
    /// A merged version is written; the remote payload becomes the base
    Merged { entity: Entity, base: Payload },
}

/// What happens to the entity's queued mutations
#[derive(Debug, Clone, PartialEq)]
pub enum QueueAction {
    /// Drop everything pending for the entity
    Discard,
    /// Replace everything pending with one mutation
    Replace(MutationRecord),
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    pub key: EntityKey,
    pub store: StoreWrite,
    pub queue: QueueAction,
}

/// Plan the resolution of a conflict
///
/// `pending` is the entity's queued mutation, if any; its fields are the
/// local side of a merge.
pub fn plan(
    resolution: Resolution,
    conflict: &ConflictItem,
    pending: Option<&MutationRecord>,
    now: DateTime<Utc>,
) -> Result<ResolutionPlan, ValidationError> {
    let local = &conflict.local_version;
    let remote = &conflict.remote_version;

    match resolution {
        Resolution::Local => Ok(keep_local(conflict, now)),
        Resolution::Remote => Ok(take_remote(conflict)),
        Resolution::Merge if local.deleted || remote.deleted => {
            if remote.modified_at >= local.modified_at {
                Ok(take_remote(conflict))
            } else {
                Ok(keep_local(conflict, now))
            }
        }
        Resolution::Merge => {
            let local_changed = match pending.and_then(|p| p.payload.as_ref()) {
                Some(payload) => payload.fields().keys().cloned().collect(),
                None => local.payload.changed_fields(conflict.base.as_ref()),
            };
            let merged = merge_fields(local, remote, conflict.base.as_ref(), &local_changed)?;
            Ok(merged_plan(conflict, merged, now))
        }
    }
}

/// Plan a resolution whose outcome was supplied by the caller
///
/// Fields the payload leaves unset keep their remote value.
pub fn plan_with_payload(
    conflict: &ConflictItem,
    payload: Payload,
    now: DateTime<Utc>,
) -> Result<ResolutionPlan, ValidationError> {
    let remote = &conflict.remote_version;
    let merged = if remote.deleted {
        payload
    } else {
        remote.payload.overlay(&payload)?
    };
    Ok(merged_plan(conflict, merged, now))
}

/// Field-level last-writer-wins merge of two live versions
pub fn merge_fields(
    local: &Entity,
    remote: &Entity,
    base: Option<&Payload>,
    local_changed: &BTreeSet<String>,
) -> Result<Payload, ValidationError> {
    remote.payload.check_type(local.entity_type())?;

    let remote_changed = remote.payload.changed_fields(base);
    let remote_is_later = remote.modified_at >= local.modified_at;
    let local_fields = local.payload.fields();
    let mut merged = remote.payload.fields();

    for field in local_changed {
        if remote_changed.contains(field) && remote_is_later {
            continue;
        }
        match local_fields.get(field) {
            Some(value) => {
                merged.insert(field.clone(), value.clone());
            }
            None => {
                merged.remove(field);
            }
        }
    }

    Payload::from_fields(remote.entity_type(), merged)
}

fn keep_local(conflict: &ConflictItem, now: DateTime<Utc>) -> ResolutionPlan {
    let local = &conflict.local_version;
    let remote = &conflict.remote_version;

    let (operation, payload) = if local.deleted {
        (Operation::Delete, None)
    } else if remote.deleted {
        (Operation::Create, Some(local.payload.clone()))
    } else {
        (Operation::Update, Some(local.payload.clone()))
    };

    let mut record = MutationRecord::new(conflict.key(), operation, payload, now);
    record.based_on = Some(remote.modified_at);

    ResolutionPlan {
        key: conflict.key(),
        store: StoreWrite::Keep,
        queue: QueueAction::Replace(record),
    }
}

fn take_remote(conflict: &ConflictItem) -> ResolutionPlan {
    ResolutionPlan {
        key: conflict.key(),
        store: StoreWrite::Synced(conflict.remote_version.clone()),
        queue: QueueAction::Discard,
    }
}

fn merged_plan(conflict: &ConflictItem, merged: Payload, now: DateTime<Utc>) -> ResolutionPlan {
    let local = &conflict.local_version;
    let remote = &conflict.remote_version;
    let modified_at = local.modified_at.max(remote.modified_at);
    let key = conflict.key();

    // Only what differs from the remote needs pushing
    let diff_fields = if remote.deleted {
        merged.fields()
    } else {
        let theirs = remote.payload.fields();
        merged
            .fields()
            .into_iter()
            .filter(|(k, v)| theirs.get(k) != Some(v))
            .collect()
    };

    let queue = if diff_fields.is_empty() && !remote.deleted {
        QueueAction::Discard
    } else {
        let operation = if remote.deleted {
            Operation::Create
        } else {
            Operation::Update
        };
        let payload = Payload::from_fields(key.entity_type, diff_fields)
            .unwrap_or_else(|_| merged.clone());
        let mut record = MutationRecord::new(key.clone(), operation, Some(payload), now);
        record.based_on = Some(remote.modified_at);
        QueueAction::Replace(record)
    };

    let base = if remote.deleted {
        Payload::empty(key.entity_type)
    } else {
        remote.payload.clone()
    };

    ResolutionPlan {
        key: key.clone(),
        store: StoreWrite::Merged {
            entity: Entity::new(key.id, merged, modified_at),
            base,
        },
        queue,
    }
}
