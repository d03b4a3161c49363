//! SQLite schema for the local store
//!
//! One database holds the entities, the mutation queue, the failed-mutation
//! list, parked conflicts and the sync watermark, so a restart resumes with
//! all of them intact. The schema version lives in `PRAGMA user_version`.

use rusqlite::Connection;

/// Version written by [`migrate`]
pub const SCHEMA_VERSION: i32 = 1;

const TABLES_V1: &str = r#"
    -- Local entities; base_payload is the last version confirmed by the remote
    CREATE TABLE IF NOT EXISTS entities (
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        base_payload TEXT,
        modified_at INTEGER NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (entity_type, entity_id)
    );

    -- Active mutation queue, ordered by seq
    CREATE TABLE IF NOT EXISTS mutations (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT UNIQUE NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        payload TEXT,
        enqueued_at INTEGER NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        based_on INTEGER
    );

    -- Mutations that will not be retried
    CREATE TABLE IF NOT EXISTS failed_mutations (
        id TEXT PRIMARY KEY,
        record TEXT NOT NULL,
        reason TEXT NOT NULL,
        kind TEXT NOT NULL,
        failed_at INTEGER NOT NULL
    );

    -- Conflicts waiting for resolution
    CREATE TABLE IF NOT EXISTS conflicts (
        id TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        local_version TEXT NOT NULL,
        remote_version TEXT NOT NULL,
        base_payload TEXT,
        detected_at INTEGER NOT NULL
    );

    -- Sync watermark and pull cursor
    CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_mutations_entity ON mutations(entity_type, entity_id);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_conflicts_entity ON conflicts(entity_type, entity_id);
"#;

/// Version stamped on the database file, 0 for a fresh file
pub fn schema_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Bring the database up to [`SCHEMA_VERSION`]
///
/// Runs in one transaction so a crash mid-upgrade leaves the old version.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let current = schema_version(conn)?;
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    tracing::debug!(from = current, to = SCHEMA_VERSION, "Migrating local store");
    conn.execute_batch(&format!(
        "BEGIN;\n{TABLES_V1}\nPRAGMA user_version = {SCHEMA_VERSION};\nCOMMIT;"
    ))
}
