//! Progress events shared by producer and consumer runs

use std::sync::Arc;

/// Where a chunk is in the fetch/verify/delete life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChunkState {
    Pending,
    Fetched,
    Verified,
    Corrupt,
    FetchFailed,
    RemoteDeleted,
    MergeEligible,
}

impl ChunkState {
    /// The local copy is known good
    pub fn is_verified(self) -> bool {
        matches!(
            self,
            ChunkState::Verified | ChunkState::RemoteDeleted | ChunkState::MergeEligible
        )
    }
}

/// Progress notifications emitted while a run is in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Producer: a chunk was cut from its origin and recorded
    ChunkRecorded { name: String, bytes: u64 },
    /// Producer: a chunk reached the remote store
    Uploaded { name: String, bytes: u64 },
    /// Producer: the consumer removed the remote copy
    Acknowledged { name: String },
    ManifestFetched { chunks: usize, groups: usize },
    Chunk { name: String, state: ChunkState },
    DeleteFailed { name: String, reason: String },
    GroupMerged { base: String, bytes: u64 },
    GroupNotMerged { base: String, reason: String },
}

/// Event sink; called from worker tasks, so it must be cheap and thread-safe.
pub type EventFn = Arc<dyn Fn(&TransferEvent) + Send + Sync>;
