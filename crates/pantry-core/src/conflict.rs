//! Conflict detection
//!
//! A conflict exists when both the local and the remote version of an entity
//! changed since the last confirmed sync. Detection is a pure function of the
//! three timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Entity, EntityKey, EntityType, Payload};

/// Both sides changed since the watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub local_modified_at: DateTime<Utc>,
    pub remote_modified_at: DateTime<Utc>,
}

/// Decide whether two versions of an entity conflict
///
/// Without a watermark nothing has ever been confirmed, so any pair of
/// versions conflicts.
pub fn detect(
    local_modified_at: DateTime<Utc>,
    remote_modified_at: DateTime<Utc>,
    last_sync_time: Option<DateTime<Utc>>,
) -> Option<Conflict> {
    let changed_since = |t: DateTime<Utc>| last_sync_time.map_or(true, |sync| t > sync);

    (changed_since(local_modified_at) && changed_since(remote_modified_at)).then_some(Conflict {
        local_modified_at,
        remote_modified_at,
    })
}

/// A detected conflict, parked until resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictItem {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub local_version: Entity,
    pub remote_version: Entity,
    pub local_modified_at: DateTime<Utc>,
    pub remote_modified_at: DateTime<Utc>,
    /// Last version both sides agreed on, when known
    pub base: Option<Payload>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictItem {
    pub fn new(
        local_version: Entity,
        remote_version: Entity,
        base: Option<Payload>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_type: local_version.entity_type(),
            entity_id: local_version.id.clone(),
            local_modified_at: local_version.modified_at,
            remote_modified_at: remote_version.modified_at,
            local_version,
            remote_version,
            base,
            detected_at,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }
}
