//! Store and Remove Protocols
//!
//! The coordinator admits client operations, issues node commands and
//! commits or aborts index transitions once acknowledgements are in.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::network::Outbound;
use crate::protocol::{NodeCommand, Reply};
use crate::replication::acks::{AckKey, AckTracker, DeparturePolicy};
use crate::replication::placement::select_targets;
use crate::replication::ReplicationConfig;
use crate::state::{ClusterMembership, FileIndex, FileStatus, NodeId};

/// Replication coordinator
pub struct Coordinator {
    config: ReplicationConfig,
    membership: Arc<ClusterMembership>,
    index: Arc<FileIndex>,
    acks: Arc<AckTracker>,
}

impl Coordinator {
    pub fn new(
        config: ReplicationConfig,
        membership: Arc<ClusterMembership>,
        index: Arc<FileIndex>,
        acks: Arc<AckTracker>,
    ) -> Self {
        Self {
            config,
            membership,
            index,
            acks,
        }
    }

    /// Run the store protocol for `name`.
    ///
    /// Sends `STORE_TO` to the client and returns once every chosen node has
    /// acknowledged. On failure the entry is gone from the index again.
    pub async fn store(&self, name: &str, size: u64, client: &Outbound) -> Result<()> {
        let required = self.config.replication_factor;
        let nodes = self.membership.node_ids().await;
        if nodes.len() < required {
            return Err(Error::NotEnoughNodes {
                live: nodes.len(),
                required,
            });
        }

        let loads = self.index.node_loads().await;
        let targets = select_targets(&nodes, &loads, required, &BTreeSet::new());
        let (slot, _guard) = self.index.begin_store(name, size, targets.clone()).await?;

        let mut wait = self
            .acks
            .register(AckKey::Store(name.to_string()), targets.iter().copied());
        // A target that left before the wait existed would never be reported
        for target in &targets {
            if !self.membership.contains(*target).await {
                wait.discharge(*target);
            }
        }

        tracing::info!("Storing {} ({} bytes) on Dstores {:?}", name, size, targets);
        if let Err(e) = client.send(&Reply::StoreTo(targets.clone())) {
            tracing::warn!("Could not send STORE_TO for {} to {}: {}", name, client.peer(), e);
        }

        let outcome = wait
            .wait_with(self.config.timeout, DeparturePolicy::Abort, |_| {
                slot.update(|e| e.acks += 1);
            })
            .await;

        if outcome.all_acknowledged() {
            let committed = slot.update(|e| {
                if e.replicas.is_empty() {
                    return false;
                }
                e.status = FileStatus::StoreComplete;
                true
            });
            if committed && self.index.holds_slot(name, &slot).await {
                tracing::info!("Store of {} complete", name);
                return Ok(());
            }
            // Every holder crashed right after acknowledging
            self.index.remove_slot(name, &slot).await;
            tracing::warn!("Store of {} lost all replicas before completing", name);
            return Err(Error::QuorumNotReached {
                file: name.to_string(),
                reached: 0,
                required,
            });
        }

        let reached = outcome.acknowledged.len();
        if outcome.timed_out {
            tracing::warn!(
                "Store of {} timed out with {}/{} acknowledgements, missing {:?}",
                name,
                reached,
                required,
                outcome.missing
            );
        } else {
            tracing::warn!(
                "Store of {} aborted, Dstores {:?} departed before acknowledging",
                name,
                outcome.departed
            );
        }

        self.index.remove_slot(name, &slot).await;
        self.discard_partial(name, &outcome.acknowledged).await;

        Err(Error::QuorumNotReached {
            file: name.to_string(),
            reached,
            required,
        })
    }

    /// Best-effort cleanup of copies written by an aborted store
    async fn discard_partial(&self, name: &str, nodes: &[NodeId]) {
        let command = NodeCommand::Remove {
            name: name.to_string(),
        };
        for id in nodes {
            match self.membership.get(*id).await {
                Some(node) => {
                    if let Err(e) = node.send(&command) {
                        tracing::warn!("Could not discard partial {} on Dstore {}: {}", name, id, e);
                    }
                }
                None => tracing::debug!("Dstore {} left before partial {} could be discarded", id, name),
            }
        }
    }

    /// Run the remove protocol for `name`.
    ///
    /// A replica holder that departs mid-wait counts as having removed its
    /// copy. Once started, a remove always runs to completion.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let slot = self.index.visible(name).await?;
        let _guard = slot.begin().await;

        // Another operation may have finished with this file while we waited
        if !self.index.holds_slot(name, &slot).await {
            return Err(Error::FileNotFound(name.to_string()));
        }
        let holders = slot
            .update(|e| {
                if !e.is_visible() {
                    return Err(e.status);
                }
                e.status = FileStatus::RemoveInProgress;
                e.acks = 0;
                Ok(e.replicas.clone())
            })
            .map_err(|status| match status {
                FileStatus::StoreComplete | FileStatus::RemoveComplete => {
                    Error::FileNotFound(name.to_string())
                }
                _ => Error::OperationInProgress(name.to_string()),
            })?;

        tracing::info!("Removing {} from Dstores {:?}", name, holders);
        let mut wait = self
            .acks
            .register(AckKey::Remove(name.to_string()), holders.iter().copied());
        let command = NodeCommand::Remove {
            name: name.to_string(),
        };
        for id in &holders {
            let sent = match self.membership.get(*id).await {
                Some(node) => node.send(&command),
                None => Err(Error::NodeNotFound(*id)),
            };
            if let Err(e) = sent {
                tracing::warn!("Could not send REMOVE {} to Dstore {}: {}", name, id, e);
                wait.discharge(*id);
            }
        }

        let outcome = wait
            .wait_with(self.config.timeout, DeparturePolicy::CountAsAck, |_| {
                slot.update(|e| e.acks += 1);
            })
            .await;
        if outcome.timed_out {
            tracing::warn!(
                "Remove of {} timed out waiting for Dstores {:?}, leftovers are reconciled on rebalance",
                name,
                outcome.missing
            );
        }

        slot.update(|e| {
            e.status = FileStatus::RemoveComplete;
            e.replicas.clear();
        });
        self.index.remove_slot(name, &slot).await;
        tracing::info!("Remove of {} complete", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::controller::testing::FakeCluster;

    async fn next_line(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("client channel closed")
    }

    fn ports(line: &str) -> Vec<NodeId> {
        line.split_whitespace().skip(1).map(|p| p.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_store_completes_after_all_acks() {
        let cluster = FakeCluster::with_nodes(3, 1000, &[1001, 1002, 1003, 1004]).await;
        let (client, mut rx) = Outbound::channel("client");

        let controller = cluster.controller.clone();
        let task = tokio::spawn(async move { controller.coordinator().store("x", 100, &client).await });

        let line = next_line(&mut rx).await;
        assert!(line.starts_with("STORE_TO"));
        let targets = ports(&line);
        assert_eq!(targets, vec![1001, 1002, 1003]);
        for target in &targets {
            cluster.ack_store(*target, "x");
        }

        task.await.unwrap().unwrap();
        let entry = cluster.controller.index().visible("x").await.unwrap().snapshot();
        assert_eq!(entry.status, FileStatus::StoreComplete);
        assert_eq!(entry.replicas, targets);
        assert_eq!(entry.acks, 3);
    }

    #[tokio::test]
    async fn test_store_targets_least_loaded_nodes() {
        let cluster = FakeCluster::with_nodes(2, 1000, &[1001, 1002, 1003]).await;
        assert_eq!(cluster.stored("a", 10).await, vec![1001, 1002]);
        assert_eq!(cluster.stored("b", 10).await, vec![1003, 1001]);
        assert_eq!(cluster.stored("c", 10).await, vec![1002, 1003]);
    }

    #[tokio::test]
    async fn test_store_rejected_without_enough_nodes() {
        let cluster = FakeCluster::with_nodes(3, 1000, &[1001, 1002]).await;
        let (client, mut rx) = Outbound::channel("client");

        let err = cluster.controller.coordinator().store("y", 100, &client).await.unwrap_err();
        assert!(matches!(err, Error::NotEnoughNodes { live: 2, required: 3 }));
        assert!(!cluster.controller.index().contains("y").await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_store_is_aborted_and_cleaned_up() {
        let cluster = FakeCluster::with_nodes(3, 200, &[1001, 1002, 1003]).await;
        let (client, mut rx) = Outbound::channel("client");

        let controller = cluster.controller.clone();
        let task = tokio::spawn(async move { controller.coordinator().store("x", 100, &client).await });
        next_line(&mut rx).await;
        cluster.ack_store(1001, "x");
        cluster.ack_store(1002, "x");

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::QuorumNotReached { reached: 2, required: 3, .. }));
        assert!(!cluster.controller.index().contains("x").await);

        // Acknowledged copies are discarded
        cluster.eventually(|c| c.disk(1001).is_empty() && c.disk(1002).is_empty()).await;

        // The name can be stored again
        assert_eq!(cluster.stored("x", 100).await.len(), 3);
    }

    #[tokio::test]
    async fn test_departure_aborts_store_early() {
        let mut cluster = FakeCluster::with_nodes(3, 5000, &[1001, 1002, 1003]).await;
        let (client, mut rx) = Outbound::channel("client");

        let controller = cluster.controller.clone();
        let task = tokio::spawn(async move { controller.coordinator().store("x", 100, &client).await });
        next_line(&mut rx).await;
        cluster.ack_store(1001, "x");
        cluster.crash(1003).await;

        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::QuorumNotReached { .. })));
        assert!(!cluster.controller.index().contains("x").await);
    }

    #[tokio::test]
    async fn test_concurrent_store_of_same_name() {
        let cluster = FakeCluster::with_nodes(3, 1000, &[1001, 1002, 1003]).await;
        let (client, mut rx) = Outbound::channel("client-1");

        let controller = cluster.controller.clone();
        let first = tokio::spawn(async move { controller.coordinator().store("x", 100, &client).await });
        let targets = ports(&next_line(&mut rx).await);

        let (other, _other_rx) = Outbound::channel("client-2");
        let err = cluster.controller.coordinator().store("x", 100, &other).await.unwrap_err();
        assert!(matches!(err, Error::FileAlreadyExists(_)));

        for target in &targets {
            cluster.ack_store(*target, "x");
        }
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_stores_of_distinct_names() {
        let cluster = FakeCluster::with_nodes(2, 1000, &[1001, 1002, 1003, 1004]).await;
        let (client_a, mut rx_a) = Outbound::channel("client-a");
        let (client_b, mut rx_b) = Outbound::channel("client-b");

        let controller = cluster.controller.clone();
        let store_a = tokio::spawn(async move { controller.coordinator().store("a", 10, &client_a).await });
        let targets_a = ports(&next_line(&mut rx_a).await);
        let controller = cluster.controller.clone();
        let store_b = tokio::spawn(async move { controller.coordinator().store("b", 10, &client_b).await });
        let targets_b = ports(&next_line(&mut rx_b).await);

        // In-flight stores already count towards node load
        assert_eq!(targets_a, vec![1001, 1002]);
        assert_eq!(targets_b, vec![1003, 1004]);

        cluster.ack_store(targets_b[0], "b");
        cluster.ack_store(targets_a[0], "a");
        cluster.ack_store(targets_b[1], "b");
        cluster.ack_store(targets_a[1], "a");

        store_a.await.unwrap().unwrap();
        store_b.await.unwrap().unwrap();
        assert_eq!(
            cluster.controller.index().list_complete().await,
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_deletes_every_replica() {
        let cluster = FakeCluster::with_nodes(2, 1000, &[1001, 1002, 1003]).await;
        let holders = cluster.stored("x", 100).await;

        cluster.controller.coordinator().remove("x").await.unwrap();
        assert!(!cluster.controller.index().contains("x").await);
        for node in holders {
            assert!(!cluster.disk(node).contains("x"));
        }
    }

    #[tokio::test]
    async fn test_remove_counts_departed_holder() {
        let mut cluster = FakeCluster::with_nodes(2, 5000, &[1001, 1002]).await;
        cluster.stored("x", 100).await;
        cluster.silence(1002);

        let controller = cluster.controller.clone();
        let task = tokio::spawn(async move { controller.coordinator().remove("x").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cluster.crash(1002).await;

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert!(!cluster.controller.index().contains("x").await);
    }

    #[tokio::test]
    async fn test_remove_completes_when_holder_never_answers() {
        let cluster = FakeCluster::with_nodes(2, 200, &[1001, 1002]).await;
        cluster.stored("x", 100).await;
        cluster.silence(1002);

        let started = tokio::time::Instant::now();
        cluster.controller.coordinator().remove("x").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(!cluster.controller.index().contains("x").await);
        assert!(!cluster.disk(1001).contains("x"));
        // The silent node keeps its copy until a rebalance finds it
        assert!(cluster.disk(1002).contains("x"));
    }

    #[tokio::test]
    async fn test_remove_of_unknown_or_busy_file() {
        let cluster = FakeCluster::with_nodes(1, 1000, &[1001]).await;
        let err = cluster.controller.coordinator().remove("missing").await.unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));

        let (client, _rx) = Outbound::channel("client");
        let controller = cluster.controller.clone();
        let store = tokio::spawn(async move { controller.coordinator().store("x", 1, &client).await });
        cluster.wait_for_entry("x").await;

        let err = cluster.controller.coordinator().remove("x").await.unwrap_err();
        assert!(matches!(err, Error::OperationInProgress(_)));
        cluster.ack_store(1001, "x");
        store.await.unwrap().unwrap();
    }
}
