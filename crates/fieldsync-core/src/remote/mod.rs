//! Remote backend collaborator
//!
//! The engine only needs push/pull primitives and a reachability signal
//! from the backend; how those map onto a wire protocol is the backend's
//! business.
//!
//! ## Implementations
//!
//! - [`MemoryRemote`]: in-process backend with fault injection, shared
//!   between simulated devices in tests
//! - [`SqliteRemote`]: a backend stored in a SQLite file that several data
//!   directories can point at, used by the CLI

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::models::{RecordId, RemoteChange, RevisionedPayload, Watermark};
use crate::network::NetworkState;

mod memory;
mod sqlite;

pub use memory::MemoryRemote;
pub use sqlite::SqliteRemote;

/// Contract the engine requires from the remote store
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Store a new version of a record
    async fn push(&self, record_id: &RecordId, payload: &RevisionedPayload)
        -> Result<(), RemoteError>;

    /// Changes with `seq > since`, oldest first, at most `limit` of them
    async fn pull_since(
        &self,
        since: Watermark,
        limit: usize,
    ) -> Result<Vec<RemoteChange>, RemoteError>;

    /// Sequence number of the newest change in the stream
    async fn head(&self) -> Result<Watermark, RemoteError>;

    /// Current reachability as seen by the backend transport
    async fn reachability(&self) -> NetworkState;
}
