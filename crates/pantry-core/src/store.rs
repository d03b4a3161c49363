//! Local store
//!
//! Durable key-value persistence of entities keyed by `(type, id)`, backed
//! by SQLite. The mutation queue, the failed-mutation list, parked conflicts
//! and the sync watermark live in the same database, so an app restart in
//! the middle of a cycle resumes with all of them intact.
//!
//! Each entity row carries two payloads:
//! - `payload`: the current local version (optimistic edits land here)
//! - `base_payload`: the last version the remote confirmed
//!
//! Deletions are kept as tombstones until the remote acknowledges them.
//!
//! ## Usage
//!
//! ```ignore
//! let store = LocalStore::open(&config)?;
//!
//! store.put(&entity)?;
//! let recipe = store.get(&EntityKey::recipe("recipe-1"))?;
//! ```

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::Config;
use crate::conflict::ConflictItem;
use crate::models::{Entity, EntityKey, EntityType, Payload};
use crate::queue::{FailedMutation, FailureKind, MutationRecord};
use crate::storage::{
    decode, encode, from_millis, migrate, to_millis, StorageError, StorageResult,
};

const META_LAST_SYNC: &str = "last_sync_time";
const META_CURSOR: &str = "cursor";

/// SQLite-backed local store
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    /// Open the store in the configured data directory
    pub fn open(config: &Config) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| StorageError::from_io(e, config.data_dir.clone()))?;
        Self::open_path(&config.sqlite_path())
    }

    /// Open a store at a specific database file
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::init(conn)
    }

    /// Open a throwaway in-memory store (tests)
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Run `f` as one atomic write; nothing it wrote survives an error
    pub fn atomically<T>(&self, f: impl FnOnce(&Self) -> StorageResult<T>) -> StorageResult<T> {
        self.conn.execute_batch("SAVEPOINT pantry_write")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE pantry_write")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch("ROLLBACK TO pantry_write; RELEASE pantry_write")
                {
                    tracing::error!(error = %rollback, "Failed to roll back local write");
                }
                Err(e)
            }
        }
    }

    // ==================== Entities ====================

    /// Get a live entity (tombstones are hidden)
    pub fn get(&self, key: &EntityKey) -> StorageResult<Option<Entity>> {
        Ok(self.get_version(key)?.filter(|e| !e.deleted))
    }

    /// Get the local version of an entity, tombstones included
    pub fn get_version(&self, key: &EntityKey) -> StorageResult<Option<Entity>> {
        let row: Option<(String, i64, bool)> = self
            .conn
            .query_row(
                "SELECT payload, modified_at, deleted FROM entities
                 WHERE entity_type = ?1 AND entity_id = ?2",
                params![key.entity_type.as_str(), key.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(payload, modified_at, deleted)| -> StorageResult<Entity> {
            Ok(Entity {
                id: key.id.clone(),
                payload: decode("entities", &payload)?,
                modified_at: from_millis("entities", modified_at)?,
                deleted,
            })
        })
        .transpose()
    }

    /// Get the last version of an entity confirmed by the remote
    pub fn base(&self, key: &EntityKey) -> StorageResult<Option<Payload>> {
        let base: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT base_payload FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
                params![key.entity_type.as_str(), key.id],
                |row| row.get(0),
            )
            .optional()?;

        base.flatten()
            .map(|json| decode("entities", &json))
            .transpose()
    }

    /// Write a local version, keeping the confirmed base
    pub fn put(&self, entity: &Entity) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO entities (entity_type, entity_id, payload, modified_at, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                payload = excluded.payload,
                modified_at = excluded.modified_at,
                deleted = excluded.deleted",
            params![
                entity.entity_type().as_str(),
                entity.id,
                encode("entities", &entity.payload)?,
                to_millis(entity.modified_at),
                entity.deleted,
            ],
        )?;
        Ok(())
    }

    /// Write a version confirmed by the remote
    ///
    /// The entity becomes both the local version and the base. A confirmed
    /// deletion removes the row.
    pub fn put_synced(&self, entity: &Entity) -> StorageResult<()> {
        if entity.deleted {
            return self.purge(&entity.key());
        }

        let payload = encode("entities", &entity.payload)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO entities
                (entity_type, entity_id, payload, base_payload, modified_at, deleted)
             VALUES (?1, ?2, ?3, ?3, ?4, 0)",
            params![
                entity.entity_type().as_str(),
                entity.id,
                payload,
                to_millis(entity.modified_at),
            ],
        )?;
        Ok(())
    }

    /// Write a local version against an explicit base
    ///
    /// Used after a merge: the remote payload is the new base, the merged
    /// payload is the local version still to be pushed.
    pub fn put_with_base(&self, entity: &Entity, base: &Payload) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO entities
                (entity_type, entity_id, payload, base_payload, modified_at, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entity.entity_type().as_str(),
                entity.id,
                encode("entities", &entity.payload)?,
                encode("entities", base)?,
                to_millis(entity.modified_at),
                entity.deleted,
            ],
        )?;
        Ok(())
    }

    /// Promote the current local version to the confirmed base
    ///
    /// Called when the remote accepts a push. Tombstones are removed.
    pub fn mark_synced(&self, key: &EntityKey) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM entities WHERE entity_type = ?1 AND entity_id = ?2 AND deleted = 1",
            params![key.entity_type.as_str(), key.id],
        )?;
        self.conn.execute(
            "UPDATE entities SET base_payload = payload WHERE entity_type = ?1 AND entity_id = ?2",
            params![key.entity_type.as_str(), key.id],
        )?;
        Ok(())
    }

    /// Delete an entity locally, leaving a tombstone for sync
    pub fn delete(&self, key: &EntityKey, at: DateTime<Utc>) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE entities SET deleted = 1, modified_at = ?3
             WHERE entity_type = ?1 AND entity_id = ?2",
            params![key.entity_type.as_str(), key.id, to_millis(at)],
        )?;

        if changed == 0 {
            self.put(&Entity::tombstone(key, at))?;
        }
        Ok(())
    }

    /// Remove every trace of an entity
    pub fn purge(&self, key: &EntityKey) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
            params![key.entity_type.as_str(), key.id],
        )?;
        Ok(())
    }

    /// All live entities of a type, ordered by id
    pub fn list(&self, entity_type: EntityType) -> StorageResult<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, payload, modified_at FROM entities
             WHERE entity_type = ?1 AND deleted = 0 ORDER BY entity_id",
        )?;
        let rows = stmt
            .query_map([entity_type.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, payload, modified_at)| -> StorageResult<Entity> {
                Ok(Entity {
                    id,
                    payload: decode("entities", &payload)?,
                    modified_at: from_millis("entities", modified_at)?,
                    deleted: false,
                })
            })
            .collect()
    }

    /// Count live entities of a type
    pub fn count(&self, entity_type: EntityType) -> StorageResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE entity_type = ?1 AND deleted = 0",
            [entity_type.as_str()],
            |row| row.get(0),
        )?)
    }

    // ==================== Mutation queue ====================

    /// Load the active queue in insertion order
    pub(crate) fn load_mutations(&self) -> StorageResult<Vec<MutationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, entity_id, operation, payload, enqueued_at,
                    attempt_count, last_error, based_on
             FROM mutations ORDER BY seq",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MutationRow {
                    id: row.get(0)?,
                    entity_type: row.get(1)?,
                    entity_id: row.get(2)?,
                    operation: row.get(3)?,
                    payload: row.get(4)?,
                    enqueued_at: row.get(5)?,
                    attempt_count: row.get(6)?,
                    last_error: row.get(7)?,
                    based_on: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(MutationRow::into_record).collect()
    }

    pub(crate) fn insert_mutation(&self, record: &MutationRecord) -> StorageResult<()> {
        let payload = record
            .payload
            .as_ref()
            .map(|p| encode("mutations", p))
            .transpose()?;

        self.conn.execute(
            "INSERT INTO mutations
                (id, entity_type, entity_id, operation, payload, enqueued_at,
                 attempt_count, last_error, based_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.entity_type.as_str(),
                record.entity_id,
                record.operation.as_str(),
                payload,
                to_millis(record.enqueued_at),
                record.attempt_count,
                record.last_error,
                record.based_on.map(to_millis),
            ],
        )?;
        Ok(())
    }

    /// Rewrite a queued record in place (its position is kept)
    pub(crate) fn update_mutation(&self, record: &MutationRecord) -> StorageResult<()> {
        let payload = record
            .payload
            .as_ref()
            .map(|p| encode("mutations", p))
            .transpose()?;

        self.conn.execute(
            "UPDATE mutations SET operation = ?2, payload = ?3, enqueued_at = ?4,
                attempt_count = ?5, last_error = ?6, based_on = ?7
             WHERE id = ?1",
            params![
                record.id,
                record.operation.as_str(),
                payload,
                to_millis(record.enqueued_at),
                record.attempt_count,
                record.last_error,
                record.based_on.map(to_millis),
            ],
        )?;
        Ok(())
    }

    pub(crate) fn delete_mutation(&self, id: &str) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM mutations WHERE id = ?1", [id])?;
        Ok(())
    }

    pub(crate) fn clear_mutations(&self) -> StorageResult<()> {
        self.conn.execute("DELETE FROM mutations", [])?;
        Ok(())
    }

    pub(crate) fn insert_failed(&self, failed: &FailedMutation) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO failed_mutations (id, record, reason, kind, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                failed.record.id,
                encode("failed_mutations", &failed.record)?,
                failed.reason,
                failed.kind.as_str(),
                to_millis(failed.failed_at),
            ],
        )?;
        Ok(())
    }

    pub(crate) fn load_failed(&self) -> StorageResult<Vec<FailedMutation>> {
        let mut stmt = self.conn.prepare(
            "SELECT record, reason, kind, failed_at FROM failed_mutations ORDER BY failed_at, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(record, reason, kind, failed_at)| -> StorageResult<FailedMutation> {
                Ok(FailedMutation {
                    record: decode("failed_mutations", &record)?,
                    reason,
                    kind: FailureKind::parse(&kind)
                        .ok_or_else(|| StorageError::corrupt("failed_mutations", kind))?,
                    failed_at: from_millis("failed_mutations", failed_at)?,
                })
            })
            .collect()
    }

    pub(crate) fn clear_failed(&self) -> StorageResult<()> {
        self.conn.execute("DELETE FROM failed_mutations", [])?;
        Ok(())
    }

    // ==================== Conflicts ====================

    /// Insert a conflict, or refresh the remote side of the one already
    /// parked for the same entity
    pub fn upsert_conflict(&self, item: &ConflictItem) -> StorageResult<()> {
        let base = item
            .base
            .as_ref()
            .map(|b| encode("conflicts", b))
            .transpose()?;

        self.conn.execute(
            "INSERT INTO conflicts
                (id, entity_type, entity_id, local_version, remote_version, base_payload, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                local_version = excluded.local_version,
                remote_version = excluded.remote_version",
            params![
                item.id,
                item.entity_type.as_str(),
                item.entity_id,
                encode("conflicts", &item.local_version)?,
                encode("conflicts", &item.remote_version)?,
                base,
                to_millis(item.detected_at),
            ],
        )?;
        Ok(())
    }

    pub fn delete_conflict(&self, id: &str) -> StorageResult<()> {
        self.conn.execute("DELETE FROM conflicts WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Parked conflicts, oldest first
    pub fn load_conflicts(&self) -> StorageResult<Vec<ConflictItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, local_version, remote_version, base_payload, detected_at
             FROM conflicts ORDER BY detected_at, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, local, remote, base, detected_at)| -> StorageResult<ConflictItem> {
                let local: Entity = decode("conflicts", &local)?;
                let remote: Entity = decode("conflicts", &remote)?;
                let base = base
                    .map(|b| decode::<Payload>("conflicts", &b))
                    .transpose()?;
                let mut item =
                    ConflictItem::new(local, remote, base, from_millis("conflicts", detected_at)?);
                item.id = id;
                Ok(item)
            })
            .collect()
    }

    // ==================== Sync metadata ====================

    /// When the last cycle completed successfully
    pub fn last_sync_time(&self) -> StorageResult<Option<DateTime<Utc>>> {
        self.get_meta(META_LAST_SYNC)?
            .map(|v| -> StorageResult<DateTime<Utc>> {
                let millis = v
                    .parse::<i64>()
                    .map_err(|e| StorageError::corrupt("sync_meta", e))?;
                from_millis("sync_meta", millis)
            })
            .transpose()
    }

    pub fn set_last_sync_time(&self, time: DateTime<Utc>) -> StorageResult<()> {
        self.set_meta(META_LAST_SYNC, &to_millis(time).to_string())
    }

    /// Pull cursor returned by the remote
    pub fn cursor(&self) -> StorageResult<Option<String>> {
        self.get_meta(META_CURSOR)
    }

    pub fn set_cursor(&self, cursor: &str) -> StorageResult<()> {
        self.set_meta(META_CURSOR, cursor)
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM sync_meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn set_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Raw `mutations` row
struct MutationRow {
    id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: Option<String>,
    enqueued_at: i64,
    attempt_count: u32,
    last_error: Option<String>,
    based_on: Option<i64>,
}

impl MutationRow {
    fn into_record(self) -> StorageResult<MutationRecord> {
        Ok(MutationRecord {
            entity_type: self
                .entity_type
                .parse()
                .map_err(|e| StorageError::corrupt("mutations", e))?,
            operation: self
                .operation
                .parse()
                .map_err(|e| StorageError::corrupt("mutations", e))?,
            payload: self
                .payload
                .map(|p| decode("mutations", &p))
                .transpose()?,
            enqueued_at: from_millis("mutations", self.enqueued_at)?,
            based_on: self
                .based_on
                .map(|b| from_millis("mutations", b))
                .transpose()?,
            id: self.id,
            entity_id: self.entity_id,
            attempt_count: self.attempt_count,
            last_error: self.last_error,
        })
    }
}
