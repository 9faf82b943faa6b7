//! Dstore Controller - Coordinator for a Replicated File-Storage Cluster
//!
//! The controller never holds file bytes. It tracks which storage nodes
//! (Dstores) hold each file's replicas, drives the acknowledgement protocol
//! that keeps stores and removes atomic across replicas, and periodically
//! rebalances placement as nodes join, leave, or crash.
//!
//! # Architecture
//!
//! All state lives in the shared [`controller::Controller`] context: the
//! membership registry, the file index and the acknowledgement tracker.
//! Every TCP connection gets its own task; a connection that opens with
//! `JOIN` belongs to a storage node and its closing is the crash signal.
//!
//! # Features
//!
//! - Least-loaded replica placement with deterministic tie-breaking
//! - Per-file operation serialization, unrelated files never contend
//! - Load fallback across replicas with `RELOAD`
//! - Periodic and join-triggered rebalancing with inventory reconciliation
//! - Read-only HTTP status API and the `dsctl` CLI

pub mod config;
pub mod error;
pub mod protocol;
pub mod state;
pub mod replication;
pub mod load;
pub mod controller;
pub mod network;
pub mod api;

pub use config::ControllerConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ControllerConfig;
    pub use crate::controller::Controller;
    pub use crate::error::{Error, Result};
    pub use crate::network::ControllerServer;
    pub use crate::protocol::{ClientRequest, NodeCommand, NodeMessage, Reply};
    pub use crate::replication::ReplicationConfig;
    pub use crate::state::{ClusterMembership, FileIndex, FileStatus, NodeId};
}
