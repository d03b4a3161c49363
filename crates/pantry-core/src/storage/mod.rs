//! Storage layer
//!
//! SQLite persistence for everything the sync engine must not lose across a
//! restart: entities, the mutation queue, failed mutations, parked conflicts
//! and the sync watermark.

pub mod error;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use schema::{migrate, schema_version, SCHEMA_VERSION};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Timestamps are stored as epoch milliseconds
pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn from_millis(table: &'static str, millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::corrupt(table, format!("timestamp out of range: {millis}")))
}

pub(crate) fn encode<T: Serialize>(table: &'static str, value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::corrupt(table, e))
}

pub(crate) fn decode<T: DeserializeOwned>(table: &'static str, json: &str) -> StorageResult<T> {
    serde_json::from_str(json).map_err(|e| StorageError::corrupt(table, e))
}
