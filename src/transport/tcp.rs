//! TCP mesh transport
//!
//! One persistent TCP connection per peer pair, established with a
//! HELLO / HELLO_ACK exchange and then carrying `PUBLISH` frames in
//! both directions. Frames use the length-prefixed JSON format from
//! [`crate::protocol`].

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::peer::PeerEntry;
use crate::protocol::{decode_frame, decode_payload, read_frame, read_frame_body, write_frame, PeerFrame};

use super::{Subscriptions, Transport};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Mesh networking configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Address to bind the listener to (port 0 = OS-assigned)
    pub listen_addr: SocketAddr,

    /// Timeout for the TCP connect of an outbound dial
    pub connection_timeout: Duration,

    /// Timeout for the HELLO / HELLO_ACK exchange
    pub handshake_timeout: Duration,

    /// Frames queued per connection before publishers wait
    pub write_queue: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            connection_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            write_queue: 64,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection state
// ─────────────────────────────────────────────────────────────────

struct PeerConnection {
    peer_id: String,

    /// Sender to write frames to this peer
    write_tx: mpsc::Sender<PeerFrame>,

    _writer: tokio::task::JoinHandle<()>,
}

// ─────────────────────────────────────────────────────────────────
// TCP mesh
// ─────────────────────────────────────────────────────────────────

/// Direct TCP connections to every configured peer
#[derive(Clone)]
pub struct TcpMesh {
    inner: Arc<MeshInner>,
}

struct MeshInner {
    config: MeshConfig,
    local_id: String,
    listener_addr: RwLock<Option<SocketAddr>>,

    /// Keyed by connection id; a peer may briefly have two connections
    /// when both sides dial at once
    connections: RwLock<HashMap<u64, PeerConnection>>,
    next_conn_id: AtomicU64,
    subscriptions: Subscriptions,
}

impl TcpMesh {
    pub fn new(config: MeshConfig, local_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MeshInner {
                config,
                local_id: local_id.into(),
                listener_addr: RwLock::new(None),
                connections: RwLock::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                subscriptions: Subscriptions::default(),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Bound listener address, once `listen` has succeeded
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.inner.listener_addr.read()
    }

    /// Drop every connection; reader tasks exit as sockets close
    pub fn shutdown(&self) {
        self.inner.connections.write().clear();
    }
}

impl MeshInner {
    fn is_connected(&self, peer_id: &str) -> bool {
        self.connections.read().values().any(|c| c.peer_id == peer_id)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Incoming peer connection");

                    let mesh = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = mesh.handle_inbound(stream).await {
                            debug!(peer_addr = %peer_addr, error = %e, "Inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Wait for HELLO, answer HELLO_ACK, then register the connection
    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let hello = tokio::time::timeout(self.config.handshake_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::ProtocolUnexpected {
                message: "no HELLO within handshake timeout".to_string(),
            })??;

        let peer_id = match hello {
            PeerFrame::Hello { peer_id } => peer_id,
            other => {
                return Err(Error::ProtocolUnexpected {
                    message: format!("expected HELLO, got {}", other.type_name()),
                })
            }
        };

        let ack = PeerFrame::HelloAck {
            peer_id: self.local_id.clone(),
        };
        write_frame(&mut stream, &ack).await?;

        info!(peer = %peer_id, "Peer connected (inbound)");
        self.setup_connection(peer_id, stream);
        Ok(())
    }

    async fn connect(self: &Arc<Self>, peer: &PeerEntry) -> Result<()> {
        let mut stream = tokio::time::timeout(
            self.config.connection_timeout,
            TcpStream::connect(peer.addr),
        )
        .await
        .map_err(|_| Error::dial_failed(&peer.id, peer.addr, "connection timeout"))?
        .map_err(|e| Error::dial_failed(&peer.id, peer.addr, e))?;

        let hello = PeerFrame::Hello {
            peer_id: self.local_id.clone(),
        };
        write_frame(&mut stream, &hello)
            .await
            .map_err(|e| Error::dial_failed(&peer.id, peer.addr, e))?;

        let ack = tokio::time::timeout(self.config.handshake_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::dial_failed(&peer.id, peer.addr, "HELLO_ACK timeout"))?
            .map_err(|e| Error::dial_failed(&peer.id, peer.addr, e))?;

        match ack {
            PeerFrame::HelloAck { peer_id } if peer_id == peer.id => {
                info!(peer = %peer_id, "Peer handshake complete (outbound)");
                self.setup_connection(peer_id, stream);
                Ok(())
            }
            PeerFrame::HelloAck { peer_id } => Err(Error::dial_failed(
                &peer.id,
                peer.addr,
                format!("endpoint identifies as {}", peer_id),
            )),
            other => Err(Error::dial_failed(
                &peer.id,
                peer.addr,
                format!("expected HELLO_ACK, got {}", other.type_name()),
            )),
        }
    }

    fn setup_connection(self: &Arc<Self>, peer_id: String, stream: TcpStream) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel::<PeerFrame>(self.config.write_queue.max(1));

        let peer_id_w = peer_id.clone();
        let writer = tokio::spawn(async move {
            write_loop(peer_id_w, write_half, write_rx).await;
        });

        self.connections.write().insert(
            conn_id,
            PeerConnection {
                peer_id: peer_id.clone(),
                write_tx,
                _writer: writer,
            },
        );

        // Reader owns cleanup: only this connection id is removed
        let mesh = Arc::clone(self);
        tokio::spawn(async move {
            mesh.read_loop(&peer_id, read_half).await;
            mesh.connections.write().remove(&conn_id);
            debug!(peer = %peer_id, conn_id, "Peer connection closed");
        });
    }

    async fn read_loop(&self, peer_id: &str, mut reader: OwnedReadHalf) {
        loop {
            let body = match read_frame_body(&mut reader).await {
                Ok(body) => body,
                Err(e) => {
                    debug!(peer = %peer_id, error = %e, "Peer read error");
                    return;
                }
            };

            match decode_frame(&body) {
                Ok(PeerFrame::Publish { topic, payload }) => match decode_payload(&payload) {
                    Ok(data) => {
                        self.subscriptions.deliver(&topic, data).await;
                    }
                    Err(e) => warn!(peer = %peer_id, error = %e, "Dropping publication"),
                },
                Ok(other) => {
                    debug!(peer = %peer_id, frame = other.type_name(), "Ignoring handshake frame")
                }
                Err(e) => warn!(peer = %peer_id, error = %e, "Dropping malformed frame"),
            }
        }
    }
}

async fn write_loop(peer_id: String, mut writer: OwnedWriteHalf, mut write_rx: mpsc::Receiver<PeerFrame>) {
    while let Some(frame) = write_rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(peer = %peer_id, error = %e, "Peer write error");
            break;
        }
    }
}

#[async_trait]
impl Transport for TcpMesh {
    async fn listen(&self) -> Result<String> {
        if let Some(addr) = self.listen_addr() {
            return Ok(addr.to_string());
        }

        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        let addr = listener.local_addr()?;

        *self.inner.listener_addr.write() = Some(addr);
        info!(addr = %addr, node = %self.inner.local_id, "Peer mesh listening");

        let mesh = Arc::clone(&self.inner);
        tokio::spawn(mesh.accept_loop(listener));

        Ok(addr.to_string())
    }

    async fn dial(&self, peer: &PeerEntry) -> Result<()> {
        if peer.id == self.inner.local_id || self.inner.is_connected(&peer.id) {
            return Ok(());
        }

        debug!(peer = %peer.id, addr = %peer.addr, "Dialing peer");
        self.inner.connect(peer).await
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let frame = PeerFrame::publish(topic, &data);

        // One connection per peer; collect senders before awaiting
        let targets: Vec<(String, mpsc::Sender<PeerFrame>)> = {
            let conns = self.inner.connections.read();
            let mut seen = HashSet::new();
            let mut ids: Vec<_> = conns.keys().copied().collect();
            ids.sort_unstable();
            ids.into_iter()
                .filter_map(|id| conns.get(&id))
                .filter(|c| seen.insert(c.peer_id.clone()))
                .map(|c| (c.peer_id.clone(), c.write_tx.clone()))
                .collect()
        };

        for (peer_id, tx) in targets {
            if tx.send(frame.clone()).await.is_err() {
                debug!(peer = %peer_id, "Failed to publish to peer");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        Ok(self.inner.subscriptions.add(topic))
    }

    fn connected_peers(&self) -> Vec<String> {
        let peers: HashSet<String> = self
            .inner
            .connections
            .read()
            .values()
            .map(|c| c.peer_id.clone())
            .collect();
        let mut peers: Vec<_> = peers.into_iter().collect();
        peers.sort();
        peers
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
