//! Load Server
//!
//! Hands clients a replica location for reads, falling back through the
//! replica set on `RELOAD` until every holder has been offered once.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::state::{FileIndex, NodeId};

/// Replica offered to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOffer {
    pub node: NodeId,
    pub size: u64,
}

/// Load attempts in flight on one client connection.
///
/// An attempt starts with `LOAD` and lasts until the next `LOAD` of the
/// same file, until every replica was offered, or until the client goes.
#[derive(Debug)]
pub struct LoadSession {
    connection_id: u64,
    attempts: HashMap<String, Vec<NodeId>>,
}

impl LoadSession {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            attempts: HashMap::new(),
        }
    }

    /// Nodes already offered for `name` in the current attempt
    pub fn tried(&self, name: &str) -> &[NodeId] {
        self.attempts.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Serves read requests from the file index
pub struct LoadServer {
    index: Arc<FileIndex>,
}

impl LoadServer {
    pub fn new(index: Arc<FileIndex>) -> Self {
        Self { index }
    }

    /// Start a fresh attempt and offer the first replica
    pub async fn load(&self, session: &mut LoadSession, name: &str) -> Result<LoadOffer> {
        session.attempts.remove(name);
        self.offer(session, name).await
    }

    /// Offer the next replica the client has not tried yet.
    ///
    /// Without an attempt in flight this behaves like [`LoadServer::load`].
    pub async fn reload(&self, session: &mut LoadSession, name: &str) -> Result<LoadOffer> {
        self.offer(session, name).await
    }

    async fn offer(&self, session: &mut LoadSession, name: &str) -> Result<LoadOffer> {
        let slot = match self.index.visible(name).await {
            Ok(slot) => slot,
            Err(e) => {
                self.finish(session, name).await;
                return Err(e);
            }
        };

        let connection = session.connection_id;
        let tried = session.attempts.entry(name.to_string()).or_default();
        let picked = slot.update(|e| {
            match e.replicas.iter().copied().find(|n| !tried.contains(n)) {
                Some(node) => {
                    e.loading_clients.insert(connection);
                    Some(LoadOffer { node, size: e.size })
                }
                None => {
                    e.loading_clients.remove(&connection);
                    None
                }
            }
        });

        match picked {
            Some(offer) => {
                tried.push(offer.node);
                Ok(offer)
            }
            None => {
                session.attempts.remove(name);
                tracing::warn!("Every replica of {} has been offered to client {}", name, connection);
                Err(Error::LoadExhausted(name.to_string()))
            }
        }
    }

    async fn finish(&self, session: &mut LoadSession, name: &str) {
        if session.attempts.remove(name).is_none() {
            return;
        }
        if let Some(slot) = self.index.get(name).await {
            slot.update(|e| e.loading_clients.remove(&session.connection_id));
        }
    }

    /// Drop every attempt of a disconnected client
    pub async fn end_session(&self, session: &mut LoadSession) {
        let names: Vec<String> = session.attempts.keys().cloned().collect();
        for name in names {
            self.finish(session, &name).await;
        }
    }
}
