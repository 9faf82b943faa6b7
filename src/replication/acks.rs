//! Acknowledgement Tracking
//!
//! Storage nodes acknowledge controller instructions asynchronously over
//! their own connections. An operation registers an [`AckWait`] for the
//! nodes it expects to hear from *before* issuing commands; node monitors
//! then deliver acknowledgements and departures into it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::state::NodeId;

/// What an acknowledgement answers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AckKey {
    Store(String),
    Remove(String),
    /// `LIST` replies during a rebalance pass
    Inventory,
    /// `REBALANCE_COMPLETE` replies
    Rebalance,
}

/// Event delivered to a waiting operation
#[derive(Debug, Clone)]
pub enum AckEvent {
    Received { node: NodeId, files: Vec<String> },
    Departed(NodeId),
}

/// How a wait treats a node that leaves before acknowledging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeparturePolicy {
    /// Stop waiting; the operation cannot succeed
    Abort,
    /// The node's share is satisfied
    CountAsAck,
    /// Stop expecting the node and keep waiting for the rest
    Exclude,
}

/// Result of a finished wait
#[derive(Debug, Clone, Default)]
pub struct AckOutcome {
    /// Nodes that acknowledged, in arrival order
    pub acknowledged: Vec<NodeId>,
    /// Nodes that left (or were discharged) before acknowledging
    pub departed: Vec<NodeId>,
    /// Nodes still outstanding when the wait ended
    pub missing: Vec<NodeId>,
    /// Payload sent with each acknowledgement
    pub payloads: HashMap<NodeId, Vec<String>>,
    pub timed_out: bool,
}

impl AckOutcome {
    /// Every expected node acknowledged
    pub fn all_acknowledged(&self) -> bool {
        self.missing.is_empty() && self.departed.is_empty()
    }

    /// Every expected node either acknowledged or departed
    pub fn all_accounted(&self) -> bool {
        self.missing.is_empty()
    }
}

struct Waiter {
    token: u64,
    tx: mpsc::UnboundedSender<AckEvent>,
}

/// Routes node acknowledgements to the operations waiting for them
pub struct AckTracker {
    waiters: Mutex<HashMap<AckKey, Vec<Waiter>>>,
    next_token: AtomicU64,
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AckKey, Vec<Waiter>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start expecting acknowledgements for `key` from `expected`
    pub fn register(
        self: &Arc<Self>,
        key: AckKey,
        expected: impl IntoIterator<Item = NodeId>,
    ) -> AckWait {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(key.clone())
            .or_default()
            .push(Waiter { token, tx });

        AckWait {
            key,
            token,
            rx,
            outstanding: expected.into_iter().collect(),
            discharged: Vec::new(),
            tracker: Arc::clone(self),
        }
    }

    /// Deliver an acknowledgement; returns false if nobody was waiting for it
    pub fn deliver(&self, key: &AckKey, node: NodeId, files: Vec<String>) -> bool {
        let waiters = self.lock();
        match waiters.get(key) {
            Some(list) if !list.is_empty() => {
                for waiter in list {
                    let _ = waiter.tx.send(AckEvent::Received {
                        node,
                        files: files.clone(),
                    });
                }
                true
            }
            _ => false,
        }
    }

    /// Tell every waiting operation that `node` has gone
    pub fn node_departed(&self, node: NodeId) {
        let waiters = self.lock();
        for waiter in waiters.values().flatten() {
            let _ = waiter.tx.send(AckEvent::Departed(node));
        }
    }

    /// Number of operations currently waiting
    pub fn pending(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn deregister(&self, key: &AckKey, token: u64) {
        let mut waiters = self.lock();
        if let Some(list) = waiters.get_mut(key) {
            list.retain(|w| w.token != token);
            if list.is_empty() {
                waiters.remove(key);
            }
        }
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered wait; deregisters itself when dropped
pub struct AckWait {
    key: AckKey,
    token: u64,
    rx: mpsc::UnboundedReceiver<AckEvent>,
    outstanding: BTreeSet<NodeId>,
    discharged: Vec<NodeId>,
    tracker: Arc<AckTracker>,
}

impl AckWait {
    /// Stop expecting `node`, recording it as departed.
    ///
    /// Used when a command could not even be sent to the node.
    pub fn discharge(&mut self, node: NodeId) {
        if self.outstanding.remove(&node) {
            self.discharged.push(node);
        }
    }

    pub async fn wait(self, timeout: Duration, policy: DeparturePolicy) -> AckOutcome {
        self.wait_with(timeout, policy, |_| {}).await
    }

    /// Wait until every expected node is accounted for or `timeout` expires.
    ///
    /// `on_ack` runs once per accepted acknowledgement.
    pub async fn wait_with(
        mut self,
        timeout: Duration,
        policy: DeparturePolicy,
        mut on_ack: impl FnMut(NodeId),
    ) -> AckOutcome {
        let deadline = Instant::now() + timeout;
        let mut outcome = AckOutcome {
            departed: std::mem::take(&mut self.discharged),
            ..AckOutcome::default()
        };

        let aborted = policy == DeparturePolicy::Abort && !outcome.departed.is_empty();
        if !aborted {
            while !self.outstanding.is_empty() {
                match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(Some(AckEvent::Received { node, files })) => {
                        if self.outstanding.remove(&node) {
                            outcome.acknowledged.push(node);
                            outcome.payloads.insert(node, files);
                            on_ack(node);
                        } else {
                            tracing::debug!("Ignoring unexpected {:?} acknowledgement from Dstore {}", self.key, node);
                        }
                    }
                    Ok(Some(AckEvent::Departed(node))) => {
                        if self.outstanding.remove(&node) {
                            outcome.departed.push(node);
                            if policy == DeparturePolicy::Abort {
                                break;
                            }
                        }
                    }
                    // The tracker keeps a sender alive while we are registered
                    Ok(None) => break,
                    Err(_) => {
                        outcome.timed_out = true;
                        break;
                    }
                }
            }
        }

        outcome.missing = self.outstanding.iter().copied().collect();
        outcome
    }
}

impl Drop for AckWait {
    fn drop(&mut self) {
        self.tracker.deregister(&self.key, self.token);
    }
}
