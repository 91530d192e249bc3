//! FieldSync Core Library
//!
//! This crate provides the save and synchronization engine for FieldSync,
//! an offline-first data-entry store that replicates records across
//! devices through a shared remote.
//!
//! # Architecture
//!
//! - **Local first**: every save is committed locally before the remote is
//!   contacted, so a save never waits on the network to be durable
//! - **Pending queue**: writes the remote has not confirmed are kept in a
//!   durable queue and replayed by the next sync pass
//! - **Vector clocks**: every version carries a clock so concurrent edits
//!   from different devices are detected and merged field by field
//!
//! # Quick Start
//!
//! ```text
//! let engine = Engine::builder(Config::load()?).build()?;
//! engine.start();
//!
//! let mutation = Mutation::new(RecordId::new("site-42")?, RecordKind::new("inspection"))
//!     .set("status", "done");
//! match engine.request_save(mutation).await {
//!     SaveOutcome::Success => {}
//!     SaveOutcome::Queued => println!("Saved offline"),
//!     other => println!("{:?}", other),
//! }
//!
//! engine.sync_now().await;
//! engine.shutdown().await;
//! ```
//!
//! # Modules
//!
//! - `engine`: Composition root and background tasks (main entry point)
//! - `save`: Per-record single-flight save pipeline
//! - `sync`: Sync passes, sessions and progress
//! - `conflict`: Causal ordering and merge strategies
//! - `queue`: Durable pending change queue and sync watermark
//! - `propagate`: Retry loop shared by saves and sync
//! - `retry`: Backoff schedule
//! - `network`: Reachability monitor
//! - `store`, `storage`: Local persistence trait and SQLite store
//! - `remote`: Remote backend trait and reference backends
//! - `config`, `identity`: Application configuration and device id

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod models;
pub mod network;
pub mod propagate;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod save;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::Config;
pub use conflict::{
    ConflictRecord, ConflictResolution, ConflictResolver, FieldMerge, LastWriterWins,
    MergeStrategy, Resolution,
};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult, ErrorKind, LocalCommitError, QueueError, RemoteError};
pub use events::{EngineEvent, EventBus};
pub use identity::Identity;
pub use models::{
    Mutation, PendingChange, RecordId, RecordKind, RemoteChange, RevisionedPayload, VectorClock,
    Watermark,
};
pub use network::{NetworkMonitor, NetworkState};
pub use queue::PendingChangeQueue;
pub use remote::{MemoryRemote, RemoteBackend, SqliteRemote};
pub use retry::RetryPolicy;
pub use save::{SaveCoordinator, SaveFailure, SaveOutcome, SaveState};
pub use storage::SqliteStore;
pub use store::{LocalStore, MemoryStore};
pub use sync::{ManualChoice, SyncOrchestrator, SyncProgress, SyncReport, SyncResult, SyncSettings};
