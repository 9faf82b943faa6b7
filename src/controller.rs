//! Controller Context
//!
//! Bundles the shared state objects and the components built on them.
//! Every connection handler and background task gets an `Arc<Controller>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::load::LoadServer;
use crate::protocol::NodeMessage;
use crate::replication::{AckKey, AckTracker, Coordinator, Rebalancer, ReplicationConfig};
use crate::state::{ClusterMembership, Departure, FileIndex, JoinOutcome, NodeHandle, NodeId};

pub struct Controller {
    config: ReplicationConfig,
    membership: Arc<ClusterMembership>,
    index: Arc<FileIndex>,
    acks: Arc<AckTracker>,
    coordinator: Coordinator,
    load_server: LoadServer,
    rebalancer: Arc<Rebalancer>,
    connection_ids: AtomicU64,
    started_at: Instant,
}

impl Controller {
    pub fn new(config: ReplicationConfig) -> Arc<Self> {
        let membership = Arc::new(ClusterMembership::new());
        let index = Arc::new(FileIndex::new());
        let acks = Arc::new(AckTracker::new());

        let coordinator = Coordinator::new(
            config.clone(),
            Arc::clone(&membership),
            Arc::clone(&index),
            Arc::clone(&acks),
        );
        let rebalancer = Arc::new(Rebalancer::new(
            config.clone(),
            Arc::clone(&membership),
            Arc::clone(&index),
            Arc::clone(&acks),
        ));

        Arc::new(Self {
            load_server: LoadServer::new(Arc::clone(&index)),
            config,
            membership,
            index,
            acks,
            coordinator,
            rebalancer,
            connection_ids: AtomicU64::new(1),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    pub fn index(&self) -> &Arc<FileIndex> {
        &self.index
    }

    pub fn acks(&self) -> &Arc<AckTracker> {
        &self.acks
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn load_server(&self) -> &LoadServer {
        &self.load_server
    }

    pub fn rebalancer(&self) -> &Arc<Rebalancer> {
        &self.rebalancer
    }

    /// Fail unless at least R nodes are joined
    pub async fn require_nodes(&self) -> Result<()> {
        let live = self.membership.live_count().await;
        let required = self.config.replication_factor;
        if live < required {
            return Err(Error::NotEnoughNodes { live, required });
        }
        Ok(())
    }

    /// Files clients can currently load
    pub async fn list_files(&self) -> Result<Vec<String>> {
        self.require_nodes().await?;
        Ok(self.index.list_complete().await)
    }

    /// Register a node that sent `JOIN`
    pub async fn node_joined(&self, id: NodeId, address: String, handle: NodeHandle) -> JoinOutcome {
        let outcome = self.membership.join(id, address.clone(), handle).await;
        match &outcome {
            JoinOutcome::Joined(_) => {
                tracing::info!("Dstore {} joined from {}", id, address);
                self.rebalancer.request();
            }
            JoinOutcome::AlreadyJoined(existing) => {
                tracing::warn!(
                    "Dstore {} joined again from {}, keeping registration from {}",
                    id,
                    address,
                    existing.address
                );
            }
        }
        outcome
    }

    /// Handle a node connection closing or failing
    pub async fn node_departed(&self, id: NodeId, connection_id: Option<u64>) -> Option<Departure> {
        let departure = self.membership.depart(id, connection_id, &self.index).await?;
        self.acks.node_departed(id);

        if departure.files_lost.is_empty() {
            tracing::warn!(
                "Dstore {} left, {} files lost a replica",
                id,
                departure.files_held.len()
            );
        } else {
            tracing::error!(
                "Dstore {} left holding the last replica of {:?}",
                id,
                departure.files_lost
            );
        }
        Some(departure)
    }

    /// Route a message received on a node connection
    pub fn node_message(&self, node: NodeId, message: NodeMessage) {
        let (key, files) = match message {
            NodeMessage::StoreAck { name } => (AckKey::Store(name), Vec::new()),
            NodeMessage::RemoveAck { name } => (AckKey::Remove(name), Vec::new()),
            NodeMessage::RemoveMissing { name } => {
                tracing::debug!("Dstore {} did not hold {} when asked to remove it", node, name);
                (AckKey::Remove(name), Vec::new())
            }
            NodeMessage::Inventory { files } => (AckKey::Inventory, files),
            NodeMessage::RebalanceComplete => (AckKey::Rebalance, Vec::new()),
        };

        if !self.acks.deliver(&key, node, files) {
            tracing::debug!("No operation waiting for {:?} from Dstore {}", key, node);
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

/// In-process storage nodes for exercising the controller without sockets
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::task::JoinHandle;

    use super::Controller;
    use crate::network::Outbound;
    use crate::protocol::{NodeCommand, NodeMessage};
    use crate::replication::ReplicationConfig;
    use crate::state::{NodeHandle, NodeId};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behaviour {
        Normal,
        /// Reads commands but never answers
        Silent,
        /// Answers everything except `REBALANCE`
        IgnoreRebalance,
        /// Does its rebalance work at once but reports completion late
        SlowRebalance,
    }

    type Disks = Arc<Mutex<HashMap<NodeId, BTreeSet<String>>>>;
    type Behaviours = Arc<Mutex<HashMap<NodeId, Behaviour>>>;

    pub struct FakeCluster {
        pub controller: Arc<Controller>,
        disks: Disks,
        behaviours: Behaviours,
        tasks: HashMap<NodeId, JoinHandle<()>>,
    }

    impl FakeCluster {
        pub fn new(replication_factor: usize, timeout_ms: u64) -> Self {
            let config = ReplicationConfig {
                replication_factor,
                timeout: Duration::from_millis(timeout_ms),
                rebalance_period: Duration::from_secs(3600),
            };
            Self {
                controller: Controller::new(config),
                disks: Arc::default(),
                behaviours: Arc::default(),
                tasks: HashMap::new(),
            }
        }

        pub async fn with_nodes(replication_factor: usize, timeout_ms: u64, nodes: &[NodeId]) -> Self {
            let mut cluster = Self::new(replication_factor, timeout_ms);
            for node in nodes {
                cluster.join(*node).await;
            }
            cluster
        }

        pub async fn join(&mut self, id: NodeId) {
            let peer = format!("127.0.0.1:{}", id);
            let (outbound, mut rx) = Outbound::channel(peer.clone());
            let handle = NodeHandle::new(id, self.controller.next_connection_id(), outbound);
            self.controller.node_joined(id, peer, handle).await;

            let controller = Arc::clone(&self.controller);
            let disks = Arc::clone(&self.disks);
            let behaviours = Arc::clone(&self.behaviours);
            let task = tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let behaviour = behaviours
                        .lock()
                        .unwrap()
                        .get(&id)
                        .copied()
                        .unwrap_or(Behaviour::Normal);
                    let command = NodeCommand::parse(&line).unwrap();
                    if let Some(reply) = respond(id, command, behaviour, &disks) {
                        if behaviour == Behaviour::SlowRebalance && reply == NodeMessage::RebalanceComplete {
                            tokio::time::sleep(Duration::from_millis(150)).await;
                        }
                        controller.node_message(id, reply);
                    }
                }
            });
            self.tasks.insert(id, task);
        }

        /// Kill a node's connection and report the departure
        pub async fn crash(&mut self, id: NodeId) {
            if let Some(task) = self.tasks.remove(&id) {
                task.abort();
            }
            self.controller.node_departed(id, None).await;
        }

        pub fn set_behaviour(&self, id: NodeId, behaviour: Behaviour) {
            self.behaviours.lock().unwrap().insert(id, behaviour);
        }

        pub fn silence(&self, id: NodeId) {
            self.set_behaviour(id, Behaviour::Silent);
        }

        pub fn disk(&self, id: NodeId) -> BTreeSet<String> {
            self.disks.lock().unwrap().get(&id).cloned().unwrap_or_default()
        }

        pub fn put(&self, id: NodeId, name: &str) {
            self.disks.lock().unwrap().entry(id).or_default().insert(name.to_string());
        }

        pub fn forget(&self, id: NodeId, name: &str) {
            if let Some(disk) = self.disks.lock().unwrap().get_mut(&id) {
                disk.remove(name);
            }
        }

        /// Simulate a client upload finishing on `id`
        pub fn ack_store(&self, id: NodeId, name: &str) {
            self.put(id, name);
            self.controller
                .node_message(id, NodeMessage::StoreAck { name: name.to_string() });
        }

        /// Store `name` with every target acknowledging; returns the targets
        pub async fn stored(&self, name: &str, size: u64) -> Vec<NodeId> {
            let (client, mut rx) = Outbound::channel("client");
            let controller = Arc::clone(&self.controller);
            let owned = name.to_string();
            let task = tokio::spawn(async move { controller.coordinator().store(&owned, size, &client).await });

            let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let targets: Vec<NodeId> = line
                .split_whitespace()
                .skip(1)
                .map(|p| p.parse().unwrap())
                .collect();
            for target in &targets {
                self.ack_store(*target, name);
            }
            task.await.unwrap().unwrap();
            targets
        }

        pub async fn wait_for_entry(&self, name: &str) {
            for _ in 0..200 {
                if self.controller.index().contains(name).await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("{} never appeared in the index", name);
        }

        pub async fn eventually(&self, check: impl Fn(&FakeCluster) -> bool) {
            for _ in 0..200 {
                if check(self) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("condition not reached");
        }
    }

    fn respond(id: NodeId, command: NodeCommand, behaviour: Behaviour, disks: &Disks) -> Option<NodeMessage> {
        if behaviour == Behaviour::Silent {
            return None;
        }
        let mut disks = disks.lock().unwrap();
        match command {
            NodeCommand::Remove { name } => {
                let removed = disks.get_mut(&id).map_or(false, |d| d.remove(&name));
                Some(if removed {
                    NodeMessage::RemoveAck { name }
                } else {
                    NodeMessage::RemoveMissing { name }
                })
            }
            NodeCommand::List => Some(NodeMessage::Inventory {
                files: disks.get(&id).map(|d| d.iter().cloned().collect()).unwrap_or_default(),
            }),
            NodeCommand::Rebalance(_) if behaviour == Behaviour::IgnoreRebalance => None,
            NodeCommand::Rebalance(instruction) => {
                let local = disks.get(&id).cloned().unwrap_or_default();
                for (file, destinations) in instruction.sends {
                    if !local.contains(&file) {
                        continue;
                    }
                    for dest in destinations {
                        disks.entry(dest).or_default().insert(file.clone());
                    }
                }
                if let Some(disk) = disks.get_mut(&id) {
                    for file in &instruction.removes {
                        disk.remove(file);
                    }
                }
                Some(NodeMessage::RebalanceComplete)
            }
        }
    }
}
