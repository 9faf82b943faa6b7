//! State Management Module
//!
//! In-memory cluster state: the registry of joined storage nodes and the
//! index of files and where their replicas live.

mod membership;
mod index;

pub use membership::{ClusterMembership, Departure, JoinOutcome, NodeHandle, NodeId, NodeInfo, StorageNode};
pub use index::{FileEntry, FileIndex, FileSlot, FileStatus, OpGuard, PurgeReport};
