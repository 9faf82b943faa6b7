//! Controller Error Types

use thiserror::Error;

use crate::protocol::Reply;
use crate::state::NodeId;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Controller error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Line codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    // Admission errors
    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File does not exist: {0}")]
    FileNotFound(String),

    #[error("Operation already in progress for file: {0}")]
    OperationInProgress(String),

    #[error("Not enough storage nodes: {live} live, {required} required")]
    NotEnoughNodes { live: usize, required: usize },

    #[error("All replicas of {0} have been tried")]
    LoadExhausted(String),

    // Node errors
    #[error("Storage node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Storage node {0} disconnected")]
    NodeDisconnected(NodeId),

    #[error("Connection to {0} is closed")]
    ConnectionClosed(String),

    #[error("Quorum not reached for {file}: {reached}/{required}")]
    QuorumNotReached {
        file: String,
        reached: usize,
        required: usize,
    },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a rejection decided before any node was contacted
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Error::FileAlreadyExists(_)
                | Error::FileNotFound(_)
                | Error::OperationInProgress(_)
                | Error::NotEnoughNodes { .. }
        )
    }

    /// Negative reply sent to a client for this error, if it has one
    pub fn reply(&self) -> Option<Reply> {
        match self {
            Error::FileAlreadyExists(_) => Some(Reply::ErrorFileAlreadyExists),
            // In-flight files are invisible to clients
            Error::FileNotFound(_) | Error::OperationInProgress(_) => {
                Some(Reply::ErrorFileDoesNotExist)
            }
            Error::NotEnoughNodes { .. } => Some(Reply::ErrorNotEnoughDstores),
            Error::LoadExhausted(_) => Some(Reply::ErrorLoad),
            Error::QuorumNotReached { .. } => Some(Reply::ErrorStoreFailed),
            _ => None,
        }
    }
}
