//! relay-sync: the chunk manifest protocol
//!
//! Leaf-first: `manifest` → `grouper` / `verifier` → `merger` →
//! `consumer` (fetch, verify, delete, merge) and `producer` (split, record,
//! upload). `local` runs verify/merge against a chunks directory with no
//! remote involved.

pub mod consumer;
pub mod events;
pub mod grouper;
pub mod local;
pub mod manifest;
pub mod merger;
pub mod producer;
mod transfer;
pub mod verifier;

pub use consumer::{ConsumeReport, Consumer, GroupOutcome};
pub use events::{ChunkState, EventFn, TransferEvent};
pub use grouper::{group, GroupMember, OriginGroup};
pub use local::{merge_local, verify_local, MergeRunReport};
pub use manifest::{Manifest, ManifestWriter};
pub use merger::{merge_group, ChunkResolver, DirResolver, MergeReport};
pub use producer::{ProduceReport, Producer};
pub use verifier::{verify_bytes, verify_file};
