//! Pantry Core Library
//!
//! This crate provides the offline-first sync engine for Pantry, a recipe
//! library that keeps working without a connection. Local edits to recipes
//! and collections land in a SQLite store immediately and are queued; the
//! engine reconciles them with the remote service whenever it can.
//!
//! # Architecture
//!
//! - **Local store**: SQLite; entities, mutation queue, parked conflicts
//! - **Mutation queue**: ordered log of local edits, coalesced per entity
//! - **Conflict detector / resolver**: watermark-based detection, then the
//!   configured strategy (local, remote, field-level merge or manual)
//! - **Sync engine**: pull/push state machine
//! - **Sync service**: tokio task serializing every operation, with the
//!   interval timer and reconnect trigger
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let network = Arc::new(NetworkMonitor::new(true));
//! let handle = spawn_sync_service(SyncEngine::open(&config, network)?);
//!
//! handle
//!     .queue_recipe_change("recipe-1", Operation::Update, Some(json!({"name": "X"})))
//!     .await?;
//! let report = handle.force_sync().await?;
//! ```
//!
//! # Modules
//!
//! - `models`: Entities, payloads and keys
//! - `store`: SQLite local store
//! - `queue`: Mutation queue
//! - `conflict`: Conflict detection
//! - `resolver`: Conflict resolution strategies
//! - `remote`: Remote service contract and HTTP client
//! - `engine`: Sync cycle state machine
//! - `service`: Serialized sync task and its handle
//! - `config`: Application configuration

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod storage;
pub mod store;

pub use config::{Config, ConfigError, ConflictStrategy, SyncConfig, SyncConfigPatch};
pub use conflict::{detect, Conflict, ConflictItem};
pub use engine::{CycleReport, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use models::{Entity, EntityKey, EntityType, Operation, Payload, ValidationError};
pub use network::NetworkMonitor;
pub use queue::{FailedMutation, FailureKind, MutationQueue, MutationRecord};
pub use remote::{HttpRemote, PullPage, PushOutcome, PushStatus, RemoteApi, RemoteError};
pub use resolver::Resolution;
pub use scheduler::{SyncScheduler, SyncTrigger};
pub use service::{spawn_sync_service, SyncHandle};
pub use status::{StatusBroadcaster, StatusSummary, Subscription, SyncErrorEntry, SyncState, SyncStatus};
pub use storage::StorageError;
pub use store::LocalStore;
