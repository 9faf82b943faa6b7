//! Replica Placement
//!
//! Pure placement decisions, kept free of I/O so they can be tested
//! directly. The load metric is the number of files a node holds; ties are
//! always broken by ascending node id.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::state::NodeId;

/// Choose `count` nodes for a new file, least loaded first
pub fn select_targets(
    nodes: &[NodeId],
    loads: &HashMap<NodeId, usize>,
    count: usize,
    exclude: &BTreeSet<NodeId>,
) -> Vec<NodeId> {
    let mut candidates: Vec<NodeId> = nodes
        .iter()
        .copied()
        .filter(|n| !exclude.contains(n))
        .collect();
    candidates.sort_by_key(|n| (loads.get(n).copied().unwrap_or(0), *n));
    candidates.dedup();
    candidates.truncate(count);
    candidates
}

/// A file as seen by the planner
#[derive(Debug, Clone)]
pub struct FileView {
    pub name: String,
    pub replicas: Vec<NodeId>,
    pub blacklist: BTreeSet<NodeId>,
}

/// Planned placement change for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePlan {
    pub name: String,
    /// Live replicas before the change
    pub current: Vec<NodeId>,
    /// Replica set after the change
    pub target: Vec<NodeId>,
    /// Nodes that must receive a copy
    pub additions: Vec<NodeId>,
    /// Nodes that must delete their copy
    pub removals: Vec<NodeId>,
}

impl FilePlan {
    pub fn is_noop(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    /// Order the plan's work so that no replica is deleted before the copy
    /// replacing it is confirmed.
    ///
    /// Each addition is sent by a node giving up its replica, which deletes
    /// its copy only after sending. Additions beyond the removals are sent
    /// by a kept replica. Removals beyond the additions wait for a later
    /// pass unless the plan copies nothing.
    pub fn schedule(&self) -> Schedule {
        let mut schedule = Schedule::default();
        if self.additions.is_empty() {
            schedule.removals = self.removals.clone();
            return schedule;
        }

        let paired = self.additions.len().min(self.removals.len());
        for (target, source) in self.additions.iter().zip(&self.removals) {
            schedule.transfers.push(Transfer {
                source: *source,
                targets: vec![*target],
                then_remove: true,
            });
        }

        let extra = &self.additions[paired..];
        if !extra.is_empty() {
            let kept = self.current.iter().copied().find(|n| self.target.contains(n));
            match (kept, schedule.transfers.last_mut()) {
                (Some(source), _) => schedule.transfers.push(Transfer {
                    source,
                    targets: extra.to_vec(),
                    then_remove: false,
                }),
                (None, Some(last)) => last.targets.extend_from_slice(extra),
                // No replica left to copy from
                (None, None) => {}
            }
        }

        schedule.deferred = self.removals[paired..].to_vec();
        schedule
    }
}

/// One node copying a file to others, optionally deleting its own copy after
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub source: NodeId,
    pub targets: Vec<NodeId>,
    pub then_remove: bool,
}

/// A plan's work for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    pub transfers: Vec<Transfer>,
    /// Deletions with no copy depending on them
    pub removals: Vec<NodeId>,
    /// Deletions held back until the copies have landed
    pub deferred: Vec<NodeId>,
}

impl Schedule {
    pub fn copies(&self) -> usize {
        self.transfers.iter().map(|t| t.targets.len()).sum()
    }

    pub fn removal_count(&self) -> usize {
        self.removals.len() + self.transfers.iter().filter(|t| t.then_remove).count()
    }
}

/// Compute a placement giving every file exactly `replication_factor`
/// distinct replicas on `nodes`, while keeping per-node file counts within
/// one of each other wherever the files being planned allow it.
///
/// `baseline` counts files on each node that are not part of this plan.
/// Existing replicas are kept where possible; under-replicated files are
/// filled before any balancing move is made.
pub fn plan_rebalance(
    files: &[FileView],
    nodes: &[NodeId],
    replication_factor: usize,
    baseline: &HashMap<NodeId, usize>,
) -> Vec<FilePlan> {
    let live: BTreeSet<NodeId> = nodes.iter().copied().collect();
    if live.len() < replication_factor || replication_factor == 0 {
        return Vec::new();
    }

    let mut counts: BTreeMap<NodeId, usize> = live
        .iter()
        .map(|n| (*n, baseline.get(n).copied().unwrap_or(0)))
        .collect();

    let current: Vec<Vec<NodeId>> = files
        .iter()
        .map(|f| {
            let mut seen = BTreeSet::new();
            f.replicas
                .iter()
                .copied()
                .filter(|n| live.contains(n) && seen.insert(*n))
                .collect()
        })
        .collect();

    let mut targets = current.clone();
    for target in &targets {
        for n in target {
            *counts.entry(*n).or_insert(0) += 1;
        }
    }

    // Trim over-replicated files from their most loaded holders
    for target in targets.iter_mut() {
        while target.len() > replication_factor {
            let heaviest = target
                .iter()
                .enumerate()
                .max_by_key(|(_, n)| (counts.get(n).copied().unwrap_or(0), **n))
                .map(|(pos, n)| (pos, *n));
            let Some((pos, node)) = heaviest else { break };
            target.remove(pos);
            decrement(&mut counts, node);
        }
    }

    // Fill missing replicas, largest deficit first
    let mut order: Vec<usize> = (0..files.len()).collect();
    order.sort_by(|&a, &b| {
        targets[a]
            .len()
            .cmp(&targets[b].len())
            .then_with(|| files[a].name.cmp(&files[b].name))
    });
    for i in order {
        while targets[i].len() < replication_factor {
            let Some(node) = least_loaded(&counts, &targets[i], &files[i].blacklist) else {
                break;
            };
            targets[i].push(node);
            *counts.entry(node).or_insert(0) += 1;
        }
    }

    level(files, &current, &mut targets, &mut counts);

    files
        .iter()
        .zip(current)
        .zip(targets)
        .map(|((file, current), target)| {
            let additions = target.iter().copied().filter(|n| !current.contains(n)).collect();
            let removals = current.iter().copied().filter(|n| !target.contains(n)).collect();
            FilePlan {
                name: file.name.clone(),
                current,
                target,
                additions,
                removals,
            }
        })
        .collect()
}

fn decrement(counts: &mut BTreeMap<NodeId, usize>, node: NodeId) {
    if let Some(count) = counts.get_mut(&node) {
        *count = count.saturating_sub(1);
    }
}

/// Least loaded node not already holding the file; blacklisted nodes only
/// when nothing else is left
fn least_loaded(
    counts: &BTreeMap<NodeId, usize>,
    holders: &[NodeId],
    blacklist: &BTreeSet<NodeId>,
) -> Option<NodeId> {
    counts
        .iter()
        .filter(|(n, _)| !holders.contains(n))
        .min_by_key(|(n, count)| (blacklist.contains(n), **count, **n))
        .map(|(n, _)| *n)
}

/// Move replicas from heavier to lighter nodes until no move narrows the
/// spread any further
fn level(
    files: &[FileView],
    current: &[Vec<NodeId>],
    targets: &mut [Vec<NodeId>],
    counts: &mut BTreeMap<NodeId, usize>,
) {
    // Every move strictly lowers the sum of squared counts, so this bound
    // is never reached in practice
    let max_moves = targets.iter().map(Vec::len).sum::<usize>() * counts.len() + 1;

    for _ in 0..max_moves {
        let mut heavy: Vec<(NodeId, usize)> = counts.iter().map(|(n, c)| (*n, *c)).collect();
        heavy.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut light = heavy.clone();
        light.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut chosen = None;
        'search: for &(from, from_count) in &heavy {
            for &(to, to_count) in &light {
                if from_count <= to_count + 1 {
                    break;
                }
                let candidate = (0..targets.len())
                    .filter(|&i| targets[i].contains(&from) && !targets[i].contains(&to))
                    .min_by_key(|&i| {
                        (
                            files[i].blacklist.contains(&to),
                            current[i].contains(&from),
                            &files[i].name,
                        )
                    });
                if let Some(i) = candidate {
                    chosen = Some((i, from, to));
                    break 'search;
                }
            }
        }

        let Some((i, from, to)) = chosen else { return };
        if let Some(slot) = targets[i].iter_mut().find(|n| **n == from) {
            *slot = to;
        }
        decrement(counts, from);
        *counts.entry(to).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(name: &str, replicas: &[NodeId]) -> FileView {
        FileView {
            name: name.to_string(),
            replicas: replicas.to_vec(),
            blacklist: BTreeSet::new(),
        }
    }

    fn per_node(plans: &[FilePlan], nodes: &[NodeId]) -> Vec<usize> {
        nodes
            .iter()
            .map(|n| plans.iter().filter(|p| p.target.contains(n)).count())
            .collect()
    }

    fn assert_balanced(plans: &[FilePlan], nodes: &[NodeId], r: usize) {
        for plan in plans {
            let distinct: BTreeSet<_> = plan.target.iter().collect();
            assert_eq!(plan.target.len(), r, "{} has {:?}", plan.name, plan.target);
            assert_eq!(distinct.len(), r, "{} has duplicates", plan.name);
            assert!(plan.target.iter().all(|n| nodes.contains(n)));
        }
        let counts = per_node(plans, nodes);
        let max = counts.iter().max().copied().unwrap_or(0);
        let min = counts.iter().min().copied().unwrap_or(0);
        assert!(max - min <= 1, "unbalanced counts {:?}", counts);
    }

    #[test]
    fn test_select_targets_prefers_least_loaded() {
        let loads = HashMap::from([(1001, 3), (1002, 1), (1003, 1), (1004, 0)]);
        let targets = select_targets(&[1001, 1002, 1003, 1004], &loads, 3, &BTreeSet::new());
        assert_eq!(targets, vec![1004, 1002, 1003]);

        let exclude = BTreeSet::from([1004]);
        let targets = select_targets(&[1001, 1002, 1003, 1004], &loads, 2, &exclude);
        assert_eq!(targets, vec![1002, 1003]);
    }

    #[test]
    fn test_crashed_replica_is_restored_on_spare_node() {
        // 1003 crashed and is no longer live
        let files = vec![view("x", &[1001, 1002])];
        let plans = plan_rebalance(&files, &[1001, 1002, 1004], 3, &HashMap::new());
        assert_eq!(plans[0].additions, vec![1004]);
        assert!(plans[0].removals.is_empty());
        let schedule = plans[0].schedule();
        assert_eq!(
            schedule.transfers,
            vec![Transfer { source: 1001, targets: vec![1004], then_remove: false }]
        );
    }

    #[test]
    fn test_new_nodes_receive_share() {
        let files: Vec<FileView> = (0..6).map(|i| view(&format!("f{}", i), &[1, 2])).collect();
        let nodes = [1, 2, 3, 4];
        let plans = plan_rebalance(&files, &nodes, 2, &HashMap::new());
        assert_balanced(&plans, &nodes, 2);
        assert_eq!(per_node(&plans, &nodes), vec![3, 3, 3, 3]);
        // Balancing moves existing copies instead of re-creating every file
        assert!(plans.iter().all(|p| p.additions.len() <= 1));
    }

    #[test]
    fn test_over_replicated_file_is_trimmed() {
        let files = vec![view("x", &[1, 2, 3, 4])];
        let plans = plan_rebalance(&files, &[1, 2, 3, 4], 2, &HashMap::new());
        assert_eq!(plans[0].target.len(), 2);
        assert_eq!(plans[0].removals.len(), 2);
        assert!(plans[0].additions.is_empty());
    }

    #[test]
    fn test_balanced_placement_is_left_alone() {
        let files = vec![view("a", &[1, 2]), view("b", &[2, 3]), view("c", &[3, 1])];
        let plans = plan_rebalance(&files, &[1, 2, 3], 2, &HashMap::new());
        assert!(plans.iter().all(FilePlan::is_noop));
    }

    #[test]
    fn test_blacklisted_node_is_avoided() {
        let mut file = view("x", &[1, 2]);
        file.blacklist.insert(3);
        let plans = plan_rebalance(&[file], &[1, 2, 3, 4], 3, &HashMap::new());
        assert_eq!(plans[0].additions, vec![4]);
    }

    #[test]
    fn test_blacklisted_node_used_as_last_resort() {
        let mut file = view("x", &[1, 2]);
        file.blacklist.insert(3);
        let plans = plan_rebalance(&[file], &[1, 2, 3], 3, &HashMap::new());
        assert_eq!(plans[0].additions, vec![3]);
    }

    #[test]
    fn test_too_few_nodes_plans_nothing() {
        let files = vec![view("x", &[1])];
        assert!(plan_rebalance(&files, &[1, 2], 3, &HashMap::new()).is_empty());
    }

    #[test]
    fn test_baseline_steers_additions() {
        let files = vec![view("x", &[1])];
        let baseline = HashMap::from([(2, 5)]);
        let plans = plan_rebalance(&files, &[1, 2, 3], 2, &baseline);
        assert_eq!(plans[0].additions, vec![3]);
    }

    #[test]
    fn test_plans_balance_arbitrary_layouts() {
        // Deterministic pseudo-random layouts
        let mut seed: u64 = 0x9e37_79b9;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for (node_count, r, file_count) in [(3, 3, 5), (4, 2, 9), (5, 3, 7), (7, 2, 20), (6, 4, 11)] {
            let nodes: Vec<NodeId> = (1..=node_count as NodeId).collect();
            let files: Vec<FileView> = (0..file_count)
                .map(|i| {
                    let holders = 1 + next() % node_count;
                    let replicas = (0..holders).map(|_| nodes[next() % node_count]).collect::<Vec<_>>();
                    view(&format!("f{}", i), &replicas)
                })
                .collect();

            let plans = plan_rebalance(&files, &nodes, r, &HashMap::new());
            assert_eq!(plans.len(), file_count);
            assert_balanced(&plans, &nodes, r);
        }
    }

    fn plan(current: &[NodeId], target: &[NodeId]) -> FilePlan {
        FilePlan {
            name: "x".into(),
            current: current.to_vec(),
            target: target.to_vec(),
            additions: target.iter().copied().filter(|n| !current.contains(n)).collect(),
            removals: current.iter().copied().filter(|n| !target.contains(n)).collect(),
        }
    }

    #[test]
    fn test_moved_replica_is_sent_by_its_old_holder() {
        let schedule = plan(&[1, 2], &[2, 3]).schedule();
        assert_eq!(
            schedule.transfers,
            vec![Transfer { source: 1, targets: vec![3], then_remove: true }]
        );
        assert!(schedule.removals.is_empty());
        assert!(schedule.deferred.is_empty());
        assert_eq!((schedule.copies(), schedule.removal_count()), (1, 1));
    }

    #[test]
    fn test_surplus_removals_wait_for_copies() {
        let schedule = plan(&[1, 2, 3], &[2, 4]).schedule();
        assert_eq!(
            schedule.transfers,
            vec![Transfer { source: 1, targets: vec![4], then_remove: true }]
        );
        assert_eq!(schedule.deferred, vec![3]);

        let trim = plan(&[1, 2, 3], &[2]).schedule();
        assert!(trim.transfers.is_empty());
        assert_eq!(trim.removals, vec![1, 3]);
    }

    #[test]
    fn test_extra_additions_come_from_kept_replica() {
        let schedule = plan(&[1, 2], &[2, 3, 4]).schedule();
        assert_eq!(
            schedule.transfers,
            vec![
                Transfer { source: 1, targets: vec![3], then_remove: true },
                Transfer { source: 2, targets: vec![4], then_remove: false },
            ]
        );
    }
}
