//! Periodic Rebalancer
//!
//! Each pass asks every live node for its inventory, reconciles the index
//! with what the nodes actually hold, then converges placement towards a
//! balanced layout with exactly R replicas per file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::Error;
use crate::protocol::{NodeCommand, RebalanceInstruction};
use crate::replication::acks::{AckKey, AckTracker, DeparturePolicy};
use crate::replication::placement::{plan_rebalance, FilePlan, FileView, Schedule};
use crate::replication::ReplicationConfig;
use crate::state::{ClusterMembership, FileIndex, FileSlot, FileStatus, NodeId, OpGuard, StorageNode};

/// Summary of one rebalance pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebalanceReport {
    /// Why the pass did nothing, if it was skipped
    pub skipped: Option<String>,
    /// Nodes that reported their inventory
    pub responders: usize,
    /// Files whose placement the pass tried to change
    pub files_planned: usize,
    pub copies: usize,
    pub removals: usize,
    /// Untracked copies deleted from nodes
    pub orphans_removed: usize,
    /// Files whose planned changes all took effect
    pub committed: usize,
    pub failed: usize,
}

/// A file held exclusively for the duration of a pass
struct Claim {
    name: String,
    slot: Arc<FileSlot>,
    replicas: Vec<NodeId>,
    blacklist: BTreeSet<NodeId>,
    _guard: OpGuard,
}

pub struct Rebalancer {
    config: ReplicationConfig,
    membership: Arc<ClusterMembership>,
    index: Arc<FileIndex>,
    acks: Arc<AckTracker>,
    trigger: Notify,
    /// Passes never overlap
    pass_lock: Mutex<()>,
}

impl Rebalancer {
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
            trigger: Notify::new(),
            pass_lock: Mutex::new(()),
        }
    }

    /// Ask for a pass ahead of the schedule
    pub fn request(&self) {
        self.trigger.notify_one();
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let rebalancer = Arc::clone(self);
        tokio::spawn(async move { rebalancer.run().await })
    }

    /// Run passes on the configured period until the task is dropped
    pub async fn run(&self) {
        let mut ticker = interval(self.config.rebalance_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {
                    tracing::debug!("Rebalance requested");
                    ticker.reset();
                }
            }

            let report = self.rebalance_once().await;
            match &report.skipped {
                Some(reason) => tracing::info!("Rebalance skipped: {}", reason),
                None => tracing::info!(
                    "Rebalance finished: {} files planned, {} committed, {} failed, {} orphans removed",
                    report.files_planned,
                    report.committed,
                    report.failed,
                    report.orphans_removed
                ),
            }
        }
    }

    /// Run a single pass
    pub async fn rebalance_once(&self) -> RebalanceReport {
        let _pass = self.pass_lock.lock().await;
        let required = self.config.replication_factor;
        let mut report = RebalanceReport::default();

        let nodes = self.membership.snapshot().await;
        if nodes.len() < required {
            report.skipped = Some(format!("{} live Dstores, {} required", nodes.len(), required));
            return report;
        }

        // Claimed before asking for inventories, so every claimed file is
        // already on disk wherever the index says it is
        let (held, indexed) = self.claim_files().await;

        let inventories = self.collect_inventories(&nodes).await;
        report.responders = inventories.len();
        if inventories.len() < required {
            report.skipped = Some(format!(
                "{} Dstores reported their files, {} required",
                inventories.len(),
                required
            ));
            return report;
        }
        let responders: Vec<NodeId> = inventories.keys().copied().collect();

        let claims = self.reconcile(held, &inventories).await;
        let baseline = self.baseline(&claims).await;

        let views: Vec<FileView> = claims
            .iter()
            .map(|c| FileView {
                name: c.name.clone(),
                replicas: c.replicas.clone(),
                blacklist: c.blacklist.clone(),
            })
            .collect();
        let plans = plan_rebalance(&views, &responders, required, &baseline);
        let schedules: Vec<Schedule> = plans.iter().map(FilePlan::schedule).collect();

        let mut instructions: BTreeMap<NodeId, RebalanceInstruction> = BTreeMap::new();
        for (plan, schedule) in plans.iter().zip(&schedules) {
            if plan.is_noop() {
                continue;
            }
            report.files_planned += 1;
            report.copies += schedule.copies();
            report.removals += schedule.removal_count();

            for transfer in &schedule.transfers {
                let instruction = instructions.entry(transfer.source).or_default();
                instruction.sends.push((plan.name.clone(), transfer.targets.clone()));
                if transfer.then_remove {
                    instruction.removes.push(plan.name.clone());
                }
            }
            for node in &schedule.removals {
                instructions.entry(*node).or_default().removes.push(plan.name.clone());
            }
            if !schedule.deferred.is_empty() {
                tracing::debug!(
                    "Holding back removal of {} from {:?} until its copies are in place",
                    plan.name,
                    schedule.deferred
                );
            }
        }

        for (node, files) in &inventories {
            for file in files {
                if indexed.contains(file) || self.index.contains(file).await {
                    continue;
                }
                tracing::info!("Dstore {} holds untracked file {}, removing it", node, file);
                instructions.entry(*node).or_default().removes.push(file.clone());
                report.orphans_removed += 1;
            }
        }

        if instructions.values().all(RebalanceInstruction::is_empty) {
            tracing::debug!("Placement already balanced");
            return report;
        }

        let completed = self.dispatch(&instructions).await;
        let live: BTreeSet<NodeId> = self.membership.node_ids().await.into_iter().collect();

        for ((claim, plan), schedule) in claims.iter().zip(&plans).zip(&schedules) {
            if plan.is_noop() {
                continue;
            }
            if self.commit(claim, plan, schedule, &completed, &live).await {
                report.committed += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Send `LIST` to every node and gather the replies.
    ///
    /// Nodes that fail to answer within the timeout, or that leave after
    /// answering, are left out.
    async fn collect_inventories(
        &self,
        nodes: &[Arc<StorageNode>],
    ) -> BTreeMap<NodeId, BTreeSet<String>> {
        let mut wait = self.acks.register(AckKey::Inventory, nodes.iter().map(|n| n.id));
        for node in nodes {
            if let Err(e) = node.send(&NodeCommand::List) {
                tracing::warn!("Could not send LIST to Dstore {}: {}", node.id, e);
                wait.discharge(node.id);
            }
        }

        let outcome = wait.wait(self.config.timeout, DeparturePolicy::Exclude).await;
        if !outcome.missing.is_empty() {
            tracing::warn!(
                "Dstores {:?} did not report their files, leaving them out of this pass",
                outcome.missing
            );
        }

        let live: BTreeSet<NodeId> = self.membership.node_ids().await.into_iter().collect();
        outcome
            .payloads
            .into_iter()
            .filter(|(node, _)| live.contains(node))
            .map(|(node, files)| (node, files.into_iter().collect()))
            .collect()
    }

    /// Lock every complete file that is not busy.
    ///
    /// Returns the held files and every name that was in the index.
    async fn claim_files(&self) -> (Vec<(String, Arc<FileSlot>, OpGuard)>, BTreeSet<String>) {
        let mut held = Vec::new();
        let mut indexed = BTreeSet::new();

        for (name, slot) in self.index.slots().await {
            indexed.insert(name.clone());

            // Files with an operation in flight are left for the next pass
            let Some(guard) = slot.try_begin() else {
                continue;
            };
            if slot.read(|e| e.status) != FileStatus::StoreComplete
                || !self.index.holds_slot(&name, &slot).await
            {
                continue;
            }
            held.push((name, slot, guard));
        }

        (held, indexed)
    }

    /// Bring held files in line with the reported inventories.
    ///
    /// A file with a replica on a node that did not report is released
    /// untouched.
    async fn reconcile(
        &self,
        held: Vec<(String, Arc<FileSlot>, OpGuard)>,
        inventories: &BTreeMap<NodeId, BTreeSet<String>>,
    ) -> Vec<Claim> {
        let mut claims = Vec::new();

        for (name, slot, guard) in held {
            // Departures may have shrunk the replica set since the claim
            let entry = slot.snapshot();
            if !self.index.holds_slot(&name, &slot).await {
                continue;
            }
            if let Some(node) = entry.replicas.iter().find(|n| !inventories.contains_key(n)) {
                tracing::debug!("Skipping {}: replica holder {} did not report", name, node);
                continue;
            }

            let reported: Vec<NodeId> = inventories
                .iter()
                .filter(|(_, files)| files.contains(&name))
                .map(|(node, _)| *node)
                .collect();
            let missing: Vec<NodeId> =
                entry.replicas.iter().copied().filter(|n| !reported.contains(n)).collect();
            let untracked: Vec<NodeId> =
                reported.iter().copied().filter(|n| !entry.holds(*n)).collect();

            let replicas = if missing.is_empty() && untracked.is_empty() {
                entry.replicas
            } else {
                if !missing.is_empty() {
                    tracing::warn!("Dstores {:?} no longer hold {}, dropping them as replicas", missing, name);
                }
                if !untracked.is_empty() {
                    tracing::info!("Adopting untracked copies of {} on Dstores {:?}", name, untracked);
                }
                slot.update(|e| {
                    e.replicas.retain(|n| !missing.contains(n));
                    e.replicas.extend(untracked.iter().copied());
                    e.replicas.clone()
                })
            };

            if replicas.is_empty() {
                tracing::error!("No Dstore holds {} any more, dropping it from the index", name);
                self.index.remove_slot(&name, &slot).await;
                continue;
            }

            claims.push(Claim {
                name,
                slot,
                replicas,
                blacklist: entry.blacklist,
                _guard: guard,
            });
        }

        claims
    }

    /// File count per node over every entry the pass is not planning
    async fn baseline(&self, claims: &[Claim]) -> HashMap<NodeId, usize> {
        let mut baseline: HashMap<NodeId, usize> = HashMap::new();
        for (name, slot) in self.index.slots().await {
            if claims.iter().any(|c| c.name == name && Arc::ptr_eq(&c.slot, &slot)) {
                continue;
            }
            slot.read(|e| {
                for node in &e.replicas {
                    *baseline.entry(*node).or_insert(0) += 1;
                }
            });
        }
        baseline
    }

    /// Send one instruction per node and return the nodes that completed
    async fn dispatch(&self, instructions: &BTreeMap<NodeId, RebalanceInstruction>) -> BTreeSet<NodeId> {
        let mut wait = self.acks.register(AckKey::Rebalance, instructions.keys().copied());
        for (id, instruction) in instructions {
            let command = NodeCommand::Rebalance(instruction.clone());
            let sent = match self.membership.get(*id).await {
                Some(node) => node.send(&command),
                None => Err(Error::NodeNotFound(*id)),
            };
            if let Err(e) = sent {
                tracing::warn!("Could not send REBALANCE to Dstore {}: {}", id, e);
                wait.discharge(*id);
            }
        }

        let outcome = wait.wait(self.config.timeout, DeparturePolicy::Exclude).await;
        if !outcome.all_acknowledged() {
            tracing::warn!(
                "Dstores {:?} did not complete their rebalance work",
                outcome.missing.iter().chain(&outcome.departed).collect::<Vec<_>>()
            );
        }
        outcome.acknowledged.into_iter().collect()
    }

    /// Apply what the nodes confirmed.
    ///
    /// A transfer counts once its source completed: its targets join the
    /// replica set and, for a move, the source leaves it. A plain removal
    /// counts once its holder completed.
    async fn commit(
        &self,
        claim: &Claim,
        plan: &FilePlan,
        schedule: &Schedule,
        completed: &BTreeSet<NodeId>,
        live: &BTreeSet<NodeId>,
    ) -> bool {
        let required = self.config.replication_factor;
        let mut all_applied = schedule.deferred.is_empty();

        let (count, empty) = claim.slot.update(|e| {
            for transfer in &schedule.transfers {
                if !completed.contains(&transfer.source) {
                    all_applied = false;
                    continue;
                }
                for node in &transfer.targets {
                    if live.contains(node) {
                        if !e.holds(*node) {
                            e.replicas.push(*node);
                        }
                    } else {
                        // The copy was sent to a node that is gone
                        e.blacklist.insert(*node);
                        all_applied = false;
                    }
                }
                if transfer.then_remove {
                    e.replicas.retain(|n| *n != transfer.source);
                }
            }
            for node in &schedule.removals {
                if completed.contains(node) {
                    e.replicas.retain(|n| n != node);
                } else {
                    all_applied = false;
                }
            }
            if e.replicas.len() == required {
                e.blacklist.clear();
            }
            (e.replicas.len(), e.replicas.is_empty())
        });

        if empty {
            tracing::error!("Rebalance left {} without replicas, dropping it from the index", claim.name);
            self.index.remove_slot(&claim.name, &claim.slot).await;
            return false;
        }

        if all_applied {
            tracing::debug!("Rebalanced {} onto {:?}", claim.name, plan.target);
        } else {
            tracing::warn!(
                "Rebalance of {} incomplete, {} of {} replicas in place",
                claim.name,
                count,
                required
            );
        }
        all_applied
    }
}
