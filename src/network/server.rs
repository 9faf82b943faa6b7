//! Network Server
//!
//! TCP accept loop and the per-connection handlers. A connection is a
//! client until it sends `JOIN`, after which it belongs to a storage node.

use std::sync::Arc;

use futures::stream::SplitStream;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use super::{write_lines, LineStream, Outbound};
use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::load::LoadSession;
use crate::protocol::{ClientRequest, NodeMessage, Reply};
use crate::state::{JoinOutcome, NodeHandle, NodeId};

/// Controller TCP server
pub struct ControllerServer {
    controller: Arc<Controller>,
    bind_address: String,
    max_line_length: usize,
    shutdown: watch::Sender<bool>,
}

impl ControllerServer {
    pub fn new(controller: Arc<Controller>, bind_address: String, max_line_length: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            controller,
            bind_address,
            max_line_length,
            shutdown: shutdown_tx,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Controller listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer = addr.to_string();
                            let controller = Arc::clone(&self.controller);
                            let max_line_length = self.max_line_length;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(controller, socket, peer.clone(), max_line_length).await {
                                    tracing::warn!("Connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Controller server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    controller: Arc<Controller>,
    socket: TcpStream,
    peer: String,
    max_line_length: usize,
) -> Result<()> {
    let framed = Framed::new(socket, LinesCodec::new_with_max_length(max_line_length));
    let (sink, mut stream) = framed.split();
    let (outbound, rx) = Outbound::channel(peer.clone());
    // Finishes by itself once every Outbound clone is gone
    tokio::spawn(write_lines(sink, rx, peer.clone()));

    let connection_id = controller.next_connection_id();
    let mut session = LoadSession::new(connection_id);
    tracing::debug!("Connection {} opened from {}", connection_id, peer);

    let result = loop {
        let line = match next_line(&mut stream, &peer).await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        let request = match ClientRequest::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Ignoring malformed line from {}: {}", peer, e);
                continue;
            }
        };

        if let ClientRequest::Join { port } = request {
            break serve_node(&controller, port, connection_id, outbound.clone(), &mut stream, &peer).await;
        }
        handle_client_request(&controller, request, &outbound, &mut session).await;
    };

    controller.load_server().end_session(&mut session).await;
    tracing::debug!("Connection {} from {} closed", connection_id, peer);
    result
}

/// Read the next line, skipping over lines that are too long.
///
/// Returns `None` once the peer has closed the connection.
async fn next_line(stream: &mut SplitStream<LineStream>, peer: &str) -> Result<Option<String>> {
    loop {
        match stream.next().await {
            Some(Ok(line)) => {
                tracing::debug!("[<-{}] {}", peer, line);
                return Ok(Some(line));
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!("Discarding over-long line from {}", peer);
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        }
    }
}

/// Node mode: deliver acknowledgements until the connection ends, then
/// report the departure
async fn serve_node(
    controller: &Controller,
    port: NodeId,
    connection_id: u64,
    outbound: Outbound,
    stream: &mut SplitStream<LineStream>,
    peer: &str,
) -> Result<()> {
    let handle = NodeHandle::new(port, connection_id, outbound);
    if let JoinOutcome::AlreadyJoined(_) = controller.node_joined(port, peer.to_string(), handle).await {
        return Ok(());
    }

    let result = loop {
        let line = match next_line(stream, peer).await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        match NodeMessage::parse(&line) {
            Ok(message) => controller.node_message(port, message),
            Err(e) => tracing::warn!("Ignoring malformed message from Dstore {}: {}", port, e),
        }
    };

    controller.node_departed(port, Some(connection_id)).await;
    result
}

async fn handle_client_request(
    controller: &Controller,
    request: ClientRequest,
    client: &Outbound,
    session: &mut LoadSession,
) {
    let command = request.command();
    let reply = match execute(controller, request, client, session).await {
        Ok(reply) => reply,
        Err(e) => match e.reply() {
            Some(reply) => {
                if e.is_admission() {
                    tracing::info!("{} from {} rejected: {}", command, client.peer(), e);
                } else {
                    tracing::warn!("{} from {} failed: {}", command, client.peer(), e);
                }
                reply
            }
            None => {
                tracing::warn!("{} from {} failed without reply: {}", command, client.peer(), e);
                return;
            }
        },
    };

    if let Err(e) = client.send(&reply) {
        tracing::debug!("Could not reply to {}: {}", client.peer(), e);
    }
}

async fn execute(
    controller: &Controller,
    request: ClientRequest,
    client: &Outbound,
    session: &mut LoadSession,
) -> Result<Reply> {
    match request {
        ClientRequest::Store { name, size } => {
            controller.coordinator().store(&name, size, client).await?;
            Ok(Reply::StoreComplete)
        }
        ClientRequest::Load { name } => {
            controller.require_nodes().await?;
            let offer = controller.load_server().load(session, &name).await?;
            Ok(Reply::LoadFrom { port: offer.node, size: offer.size })
        }
        ClientRequest::Reload { name } => {
            controller.require_nodes().await?;
            let offer = controller.load_server().reload(session, &name).await?;
            Ok(Reply::LoadFrom { port: offer.node, size: offer.size })
        }
        ClientRequest::Remove { name } => {
            controller.require_nodes().await?;
            controller.coordinator().remove(&name).await?;
            Ok(Reply::RemoveComplete)
        }
        ClientRequest::List => Ok(Reply::List(controller.list_files().await?)),
        ClientRequest::Join { .. } => Err(Error::Protocol("JOIN is only valid as a handshake".into())),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::SinkExt;

    use super::*;
    use crate::replication::ReplicationConfig;

    async fn start_server() -> (Arc<Controller>, std::net::SocketAddr) {
        let controller = Controller::new(ReplicationConfig {
            replication_factor: 1,
            ..ReplicationConfig::default()
        });
        let server = ControllerServer::new(Arc::clone(&controller), "127.0.0.1:0".into(), 1024);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve(listener).await });
        (controller, addr)
    }

    async fn connect(addr: std::net::SocketAddr) -> Framed<TcpStream, LinesCodec> {
        Framed::new(TcpStream::connect(addr).await.unwrap(), LinesCodec::new())
    }

    async fn recv(conn: &mut Framed<TcpStream, LinesCodec>) -> String {
        tokio::time::timeout(Duration::from_secs(2), conn.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_without_nodes_is_rejected() {
        let (_controller, addr) = start_server().await;
        let mut client = connect(addr).await;

        client.send("LIST".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "ERROR_NOT_ENOUGH_DSTORES");
    }

    #[tokio::test]
    async fn test_malformed_lines_keep_connection_open() {
        let (_controller, addr) = start_server().await;
        let mut client = connect(addr).await;

        client.send("FETCH x".to_string()).await.unwrap();
        client.send("x".repeat(2048)).await.unwrap();
        client.send("LOAD x".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "ERROR_NOT_ENOUGH_DSTORES");
    }

    #[tokio::test]
    async fn test_node_join_and_departure() {
        let (controller, addr) = start_server().await;
        let mut node = connect(addr).await;
        node.send("JOIN 1001".to_string()).await.unwrap();

        for _ in 0..200 {
            if controller.membership().contains(1001).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(controller.membership().contains(1001).await);

        let mut client = connect(addr).await;
        client.send("LIST".to_string()).await.unwrap();
        assert_eq!(recv(&mut client).await, "LIST");

        drop(node);
        for _ in 0..200 {
            if !controller.membership().contains(1001).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node departure was not detected");
    }
}
