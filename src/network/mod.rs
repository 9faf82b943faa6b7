//! Network Module
//!
//! Handles the TCP text-line connections from clients and storage nodes.

mod server;

pub use server::ControllerServer;

use std::fmt::Display;

use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::{Error, Result};

/// Line-framed TCP connection
pub type LineStream = Framed<TcpStream, LinesCodec>;

/// Sending half of a connection.
///
/// Lines are queued on an unbounded channel and written by a dedicated
/// writer task, so senders never block on a slow peer.
#[derive(Debug, Clone)]
pub struct Outbound {
    peer: String,
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    pub fn new(peer: String, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { peer, tx }
    }

    /// Create an outbound handle together with the receiving end of its queue
    pub fn channel(peer: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(peer.into(), tx), rx)
    }

    /// Peer address, for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue one protocol line
    pub fn send(&self, message: &impl Display) -> Result<()> {
        let line = message.to_string();
        tracing::debug!("[->{}] {}", self.peer, line);
        self.tx
            .send(line)
            .map_err(|_| Error::ConnectionClosed(self.peer.clone()))
    }

    /// Whether the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain an outbound queue into the socket until either side closes
pub(crate) async fn write_lines(
    mut sink: SplitSink<LineStream, String>,
    mut rx: mpsc::UnboundedReceiver<String>,
    peer: String,
) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            tracing::warn!("Failed to write to {}: {}", peer, e);
            break;
        }
    }
    // Dropping the receiver marks every Outbound for this peer as closed
    rx.close();
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reply;

    #[tokio::test]
    async fn test_outbound_queues_lines() {
        let (outbound, mut rx) = Outbound::channel("client-1");
        outbound.send(&Reply::StoreComplete).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "STORE_COMPLETE");
    }

    #[tokio::test]
    async fn test_outbound_reports_closed_peer() {
        let (outbound, rx) = Outbound::channel("client-1");
        drop(rx);
        assert!(outbound.is_closed());
        assert!(matches!(
            outbound.send(&Reply::StoreComplete),
            Err(Error::ConnectionClosed(_))
        ));
    }
}
