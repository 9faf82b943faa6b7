//! Cluster Membership Management
//!
//! Tracks the storage nodes currently joined to the controller and the
//! connection handle used to instruct each of them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use super::index::FileIndex;
use crate::error::{Error, Result};
use crate::network::Outbound;
use crate::protocol::NodeCommand;

/// Storage nodes are identified by the port they advertise on join
pub type NodeId = u16;

/// Handle for sending commands to one joined node
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    connection_id: u64,
    outbound: Outbound,
}

impl NodeHandle {
    pub fn new(id: NodeId, connection_id: u64, outbound: Outbound) -> Self {
        Self { id, connection_id, outbound }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Identifies the TCP connection this handle writes to
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn send(&self, command: &NodeCommand) -> Result<()> {
        self.outbound
            .send(command)
            .map_err(|_| Error::NodeDisconnected(self.id))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// A registered storage node
#[derive(Debug)]
pub struct StorageNode {
    pub id: NodeId,
    /// Remote socket address of the node's connection
    pub address: String,
    pub joined_at: chrono::DateTime<chrono::Utc>,
    handle: NodeHandle,
    alive: AtomicBool,
}

impl StorageNode {
    fn new(id: NodeId, address: String, handle: NodeHandle) -> Self {
        Self {
            id,
            address,
            joined_at: chrono::Utc::now(),
            handle,
            alive: AtomicBool::new(true),
        }
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    /// False once the node has been deregistered
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn send(&self, command: &NodeCommand) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::NodeDisconnected(self.id));
        }
        self.handle.send(command)
    }

    fn mark_departed(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            address: self.address.clone(),
            joined_at: self.joined_at,
            alive: self.is_alive(),
        }
    }
}

/// Serializable view of a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub joined_at: chrono::DateTime<chrono::Utc>,
    pub alive: bool,
}

/// Result of a join handshake
#[derive(Debug, Clone)]
pub enum JoinOutcome {
    /// The node was not registered before
    Joined(Arc<StorageNode>),
    /// A live node with this id is already registered; nothing changed
    AlreadyJoined(Arc<StorageNode>),
}

/// What was cleaned up when a node left
#[derive(Debug, Clone)]
pub struct Departure {
    pub node: Arc<StorageNode>,
    /// Files that listed the node as a replica holder
    pub files_held: Vec<String>,
    /// Files dropped from the index because the node held their last replica
    pub files_lost: Vec<String>,
}

/// Registry of joined storage nodes
pub struct ClusterMembership {
    nodes: RwLock<BTreeMap<NodeId, Arc<StorageNode>>>,
}

impl ClusterMembership {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a node. Re-joining with a live id is a no-op.
    pub async fn join(&self, id: NodeId, address: String, handle: NodeHandle) -> JoinOutcome {
        let mut nodes = self.nodes.write().await;

        if let Some(existing) = nodes.get(&id) {
            if !existing.handle().is_closed() {
                return JoinOutcome::AlreadyJoined(Arc::clone(existing));
            }
            // Old connection is dead but its monitor has not reported yet
            tracing::debug!("Replacing stale registration of Dstore {}", id);
            existing.mark_departed();
        }

        let node = Arc::new(StorageNode::new(id, address, handle));
        nodes.insert(id, Arc::clone(&node));
        JoinOutcome::Joined(node)
    }

    /// Deregister a node and purge it from every file's replica set.
    ///
    /// With `connection_id` set, only the registration made over that
    /// connection is removed; a departure reported by a superseded
    /// connection changes nothing.
    ///
    /// The membership write lock is held until the purge finishes, so no
    /// snapshot can observe the node gone while files still reference it.
    pub async fn depart(
        &self,
        id: NodeId,
        connection_id: Option<u64>,
        index: &FileIndex,
    ) -> Option<Departure> {
        let mut nodes = self.nodes.write().await;
        let registered = nodes
            .get(&id)
            .map(|node| connection_id.map_or(true, |conn| node.handle().connection_id() == conn))
            .unwrap_or(false);
        if !registered {
            return None;
        }
        let node = nodes.remove(&id)?;
        node.mark_departed();

        let report = index.purge_node(id).await;
        drop(nodes);

        Some(Departure {
            node,
            files_held: report.shrunk,
            files_lost: report.pruned,
        })
    }

    pub async fn get(&self, id: NodeId) -> Option<Arc<StorageNode>> {
        self.nodes.read().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: NodeId) -> bool {
        self.nodes.read().await.contains_key(&id)
    }

    /// Point-in-time view of live nodes, ordered by id
    pub async fn snapshot(&self) -> Vec<Arc<StorageNode>> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Ids of live nodes, ascending
    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().await.keys().copied().collect()
    }

    pub async fn live_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn infos(&self) -> Vec<NodeInfo> {
        self.nodes.read().await.values().map(|n| n.info()).collect()
    }
}

impl Default for ClusterMembership {
    fn default() -> Self {
        Self::new()
    }
}
