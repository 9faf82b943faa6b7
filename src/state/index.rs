//! File Index
//!
//! Authoritative mapping from file name to replication state and replica
//! locations. Each file lives in its own [`FileSlot`], so unrelated files
//! never contend with each other.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::RwLock;

use super::membership::NodeId;
use crate::error::{Error, Result};

/// Replication state of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileStatus {
    StoreInProgress,
    StoreComplete,
    RemoveInProgress,
    RemoveComplete,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStatus::StoreInProgress => write!(f, "STORE_IN_PROGRESS"),
            FileStatus::StoreComplete => write!(f, "STORE_COMPLETE"),
            FileStatus::RemoveInProgress => write!(f, "REMOVE_IN_PROGRESS"),
            FileStatus::RemoveComplete => write!(f, "REMOVE_COMPLETE"),
        }
    }
}

/// State of a single file
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Declared size in bytes
    pub size: u64,
    pub status: FileStatus,
    /// Nodes holding (or, while storing, chosen to hold) a replica
    pub replicas: Vec<NodeId>,
    /// Nodes that failed an operation on this file and are avoided as targets
    pub blacklist: BTreeSet<NodeId>,
    /// Acknowledgements received for the operation in flight
    pub acks: usize,
    /// Client connections with a load attempt in flight
    pub loading_clients: BTreeSet<u64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl FileEntry {
    fn new(name: String, size: u64, replicas: Vec<NodeId>) -> Self {
        Self {
            name,
            size,
            status: FileStatus::StoreInProgress,
            replicas,
            blacklist: BTreeSet::new(),
            acks: 0,
            loading_clients: BTreeSet::new(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Loadable by clients
    pub fn is_visible(&self) -> bool {
        self.status == FileStatus::StoreComplete && !self.replicas.is_empty()
    }

    pub fn holds(&self, node: NodeId) -> bool {
        self.replicas.contains(&node)
    }
}

/// Guard proving exclusive right to run a store, remove or rebalance on a file
pub type OpGuard = tokio::sync::OwnedMutexGuard<()>;

/// One file's entry together with the lock that serializes operations on it.
///
/// `entry` is only ever locked for short, non-async sections; `op_lock` is
/// held for the whole duration of an operation, across awaits.
#[derive(Debug)]
pub struct FileSlot {
    entry: Mutex<FileEntry>,
    op_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileSlot {
    fn new(entry: FileEntry) -> Self {
        Self {
            entry: Mutex::new(entry),
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FileEntry> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read<R>(&self, f: impl FnOnce(&FileEntry) -> R) -> R {
        f(&self.lock())
    }

    /// Apply a transition atomically with respect to every other reader
    pub fn update<R>(&self, f: impl FnOnce(&mut FileEntry) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> FileEntry {
        self.lock().clone()
    }

    /// Claim the operation lock without waiting
    pub fn try_begin(&self) -> Option<OpGuard> {
        Arc::clone(&self.op_lock).try_lock_owned().ok()
    }

    /// Wait for the operation in flight, if any, then claim the lock
    pub async fn begin(&self) -> OpGuard {
        Arc::clone(&self.op_lock).lock_owned().await
    }
}

/// Files touched when a node was purged
#[derive(Debug, Clone, Default)]
pub struct PurgeReport {
    /// Files that lost the node as a replica holder, by name
    pub shrunk: Vec<String>,
    /// Files removed because no replica remained
    pub pruned: Vec<String>,
}

/// The controller's file table
pub struct FileIndex {
    files: RwLock<BTreeMap<String, Arc<FileSlot>>>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
        }
    }

    /// Admit a store: insert a `StoreInProgress` entry for `targets`.
    ///
    /// Fails if the name is present in any state. The returned guard is
    /// already held, so no other operation can touch the file until the
    /// store finishes.
    pub async fn begin_store(
        &self,
        name: &str,
        size: u64,
        targets: Vec<NodeId>,
    ) -> Result<(Arc<FileSlot>, OpGuard)> {
        let mut files = self.files.write().await;
        if let Some(existing) = files.get(name) {
            let status = existing.read(|e| e.status);
            tracing::debug!("Store of {} rejected, entry is {}", name, status);
            return Err(Error::FileAlreadyExists(name.to_string()));
        }

        let slot = Arc::new(FileSlot::new(FileEntry::new(name.to_string(), size, targets)));
        let guard = slot
            .try_begin()
            .ok_or_else(|| Error::Internal(format!("fresh slot for {} is locked", name)))?;
        files.insert(name.to_string(), Arc::clone(&slot));
        Ok((slot, guard))
    }

    pub async fn get(&self, name: &str) -> Option<Arc<FileSlot>> {
        self.files.read().await.get(name).cloned()
    }

    /// Look up a file that clients may currently see
    pub async fn visible(&self, name: &str) -> Result<Arc<FileSlot>> {
        let slot = self
            .get(name)
            .await
            .ok_or_else(|| Error::FileNotFound(name.to_string()))?;
        let (status, visible) = slot.read(|e| (e.status, e.is_visible()));
        match status {
            FileStatus::StoreInProgress | FileStatus::RemoveInProgress => {
                Err(Error::OperationInProgress(name.to_string()))
            }
            _ if !visible => Err(Error::FileNotFound(name.to_string())),
            _ => Ok(slot),
        }
    }

    /// Whether `slot` is still the entry registered under `name`
    pub async fn holds_slot(&self, name: &str, slot: &Arc<FileSlot>) -> bool {
        self.files
            .read()
            .await
            .get(name)
            .map(|current| Arc::ptr_eq(current, slot))
            .unwrap_or(false)
    }

    /// Delete the entry for `name` if it is still `slot`.
    ///
    /// An entry pruned and re-created under the same name in the meantime
    /// is left alone.
    pub async fn remove_slot(&self, name: &str, slot: &Arc<FileSlot>) -> bool {
        let mut files = self.files.write().await;
        let same = files
            .get(name)
            .map(|current| Arc::ptr_eq(current, slot))
            .unwrap_or(false);
        if same {
            files.remove(name);
        }
        same
    }

    /// Drop a node from every replica set, pruning entries left empty
    pub async fn purge_node(&self, node: NodeId) -> PurgeReport {
        let mut files = self.files.write().await;
        let mut report = PurgeReport::default();

        for (name, slot) in files.iter() {
            let emptied = slot.update(|e| {
                if !e.holds(node) {
                    return None;
                }
                e.replicas.retain(|n| *n != node);
                Some(e.replicas.is_empty())
            });
            match emptied {
                Some(true) => {
                    report.shrunk.push(name.clone());
                    report.pruned.push(name.clone());
                }
                Some(false) => report.shrunk.push(name.clone()),
                None => {}
            }
        }

        for name in &report.pruned {
            files.remove(name);
        }
        report
    }

    /// Names of files visible to clients, sorted
    pub async fn list_complete(&self) -> Vec<String> {
        self.files
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.read(|e| e.is_visible()))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every slot, sorted by name
    pub async fn slots(&self) -> Vec<(String, Arc<FileSlot>)> {
        self.files
            .read()
            .await
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<FileEntry> {
        self.files.read().await.values().map(|slot| slot.snapshot()).collect()
    }

    /// Number of index entries each node appears in
    pub async fn node_loads(&self) -> HashMap<NodeId, usize> {
        let files = self.files.read().await;
        let mut loads = HashMap::new();
        for slot in files.values() {
            slot.read(|e| {
                for node in &e.replicas {
                    *loads.entry(*node).or_insert(0) += 1;
                }
            });
        }
        loads
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.files.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

impl Default for FileIndex {
    fn default() -> Self {
        Self::new()
    }
}
