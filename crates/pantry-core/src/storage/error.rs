//! Storage errors
//!
//! Every failure of the local store surfaces as a [`StorageError`]. The
//! engine treats all of them as transient: the write is rolled back, the
//! queue stays as it was, and the operation can be retried.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cannot create data directory '{path}': {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied for '{path}'. Check the owner and mode of the data directory.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No space left for '{path}'. Local changes cannot be saved until space is freed.")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot open database '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row holds JSON or a timestamp we cannot read back
    #[error("Unreadable row in '{table}': {details}")]
    CorruptRecord { table: &'static str, details: String },
}

impl StorageError {
    /// Classify a filesystem error on `path`
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        if error.kind() == io::ErrorKind::PermissionDenied {
            StorageError::PermissionDenied {
                path,
                source: error,
            }
        } else if is_out_of_space(&error) {
            StorageError::DiskFull {
                path,
                source: error,
            }
        } else {
            StorageError::DataDir {
                path,
                source: error,
            }
        }
    }

    pub(crate) fn corrupt(table: &'static str, details: impl ToString) -> Self {
        StorageError::CorruptRecord {
            table,
            details: details.to_string(),
        }
    }

    /// SQLite ran out of disk
    pub fn is_disk_full(&self) -> bool {
        match self {
            StorageError::DiskFull { .. } => true,
            StorageError::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::DiskFull
            }
            _ => false,
        }
    }
}

fn is_out_of_space(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    ["no space left", "disk full", "quota exceeded", "not enough space"]
        .iter()
        .any(|needle| msg.contains(needle))
}

pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_permission() {
        let err = StorageError::from_io(
            io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
            PathBuf::from("/var/pantry"),
        );
        assert!(matches!(err, StorageError::PermissionDenied { .. }));
        assert!(err.to_string().contains("/var/pantry"));
    }

    #[test]
    fn test_from_io_out_of_space() {
        let err = StorageError::from_io(
            io::Error::new(io::ErrorKind::Other, "No space left on device"),
            PathBuf::from("/full"),
        );
        assert!(err.is_disk_full());
    }

    #[test]
    fn test_from_io_other() {
        let err = StorageError::from_io(
            io::Error::new(io::ErrorKind::NotFound, "no parent"),
            PathBuf::from("/missing/dir"),
        );
        assert!(matches!(err, StorageError::DataDir { .. }));
        assert!(!err.is_disk_full());
    }

    #[test]
    fn test_corrupt_record_names_table() {
        let err = StorageError::corrupt("mutations", "expected value at line 1");
        let msg = err.to_string();
        assert!(msg.contains("mutations"));
        assert!(msg.contains("expected value"));
    }
}
