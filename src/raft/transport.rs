//! Replica RPC Transport
//!
//! Vote, append-entries, and install-snapshot exchanges between replicas.
//! Frames are `[len: u32 LE][json]` over TCP, with a small per-target
//! connection pool. The in-memory mesh backs single-process cluster tests.

use super::log::LogEntry;
use super::Configuration;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// Maximum accepted frame size (a snapshot install dominates).
const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Errors from the replica transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {addr} unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("transport closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader: String,
    pub leader_addr: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// Follower's last log index; the leader uses it to repair `next_index`.
    pub last_index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader: String,
    pub leader_addr: String,
    pub last_index: u64,
    pub last_term: u64,
    pub configuration: Configuration,
    /// Gzip-compressed snapshot payload.
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// An RPC request between replicas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Vote(VoteRequest),
    Append(AppendRequest),
    Snapshot(InstallSnapshotRequest),
}

/// An RPC response between replicas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Vote(VoteResponse),
    Append(AppendResponse),
    Snapshot(InstallSnapshotResponse),
}

/// An inbound RPC handed to the replica task for processing.
pub struct Inbound {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Channel of inbound RPCs, consumed by the replica task.
pub type InboundRx = mpsc::Receiver<Inbound>;

/// Outbound side of a replica transport.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send `request` to the replica listening at `addr` and await its
    /// response.
    async fn send(&self, addr: &str, request: Request) -> Result<Response, TransportError>;
}

// ============================================================================
// TCP transport
// ============================================================================

/// TCP transport with framed JSON and a bounded per-target connection pool.
pub struct TcpTransport {
    connect_timeout: Duration,
    pool_size: usize,
    pool: Mutex<HashMap<String, Vec<TcpStream>>>,
}

impl TcpTransport {
    /// Bind `listen_addr` and return the outbound half plus the inbound RPC
    /// stream. The accept loop runs until the returned receiver is dropped.
    pub async fn bind(
        listen_addr: &str,
        connect_timeout: Duration,
        pool_size: usize,
        inbound_buffer: usize,
    ) -> Result<(Arc<Self>, InboundRx, std::net::SocketAddr), TransportError> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(inbound_buffer.max(1));
        tokio::spawn(accept_loop(listener, tx));
        let transport = Arc::new(Self {
            connect_timeout,
            pool_size: pool_size.max(1),
            pool: Mutex::new(HashMap::new()),
        });
        Ok((transport, rx, local_addr))
    }

    async fn checkout(&self, addr: &str) -> Result<TcpStream, TransportError> {
        {
            let mut pool = self.pool.lock().await;
            if let Some(conns) = pool.get_mut(addr) {
                if let Some(stream) = conns.pop() {
                    return Ok(stream);
                }
            }
        }
        let connect = TcpStream::connect(addr);
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::Unreachable {
                addr: addr.to_string(),
                source: e,
            }),
            Err(_) => Err(TransportError::Timeout(addr.to_string())),
        }
    }

    async fn checkin(&self, addr: &str, stream: TcpStream) {
        let mut pool = self.pool.lock().await;
        let conns = pool.entry(addr.to_string()).or_default();
        if conns.len() < self.pool_size {
            conns.push(stream);
        }
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn send(&self, addr: &str, request: Request) -> Result<Response, TransportError> {
        let mut stream = self.checkout(addr).await?;
        let frame = serde_json::to_vec(&request)?;
        if let Err(e) = write_frame(&mut stream, &frame).await {
            return Err(TransportError::Unreachable {
                addr: addr.to_string(),
                source: e,
            });
        }
        let reply = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(e) => {
                return Err(TransportError::Unreachable {
                    addr: addr.to_string(),
                    source: e,
                })
            }
        };
        let response: Response = serde_json::from_slice(&reply)?;
        self.checkin(addr, stream).await;
        Ok(response)
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Inbound>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "raft accept failed");
                continue;
            }
        };
        debug!(%remote, "raft connection accepted");
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, tx).await {
                debug!(%remote, error = %e, "raft connection closed");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    tx: mpsc::Sender<Inbound>,
) -> Result<(), TransportError> {
    loop {
        let frame = read_frame(&mut stream).await?;
        let request: Request = serde_json::from_slice(&frame)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Inbound {
            request,
            reply: reply_tx,
        })
        .await
        .map_err(|_| TransportError::Closed)?;
        let response = reply_rx.await.map_err(|_| TransportError::Closed)?;
        let frame = serde_json::to_vec(&response)?;
        write_frame(&mut stream, &frame).await?;
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + frame.len());
    buf.put_u32_le(frame.len() as u32);
    buf.put_slice(frame);
    stream.write_all(&buf).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = (&len_buf[..]).get_u32_le() as usize;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

// ============================================================================
// In-memory transport (tests and in-process clusters)
// ============================================================================

type MemoryRegistry = StdMutex<HashMap<String, mpsc::Sender<Inbound>>>;

/// A mesh of in-process replica endpoints addressed by name.
#[derive(Default)]
pub struct MemoryNetwork {
    registry: MemoryRegistry,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `addr` on the mesh, returning its transport and inbound
    /// stream.
    pub fn join(self: &Arc<Self>, addr: &str) -> (Arc<MemoryTransport>, InboundRx) {
        let (tx, rx) = mpsc::channel(1024);
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr.to_string(), tx);
        let transport = Arc::new(MemoryTransport {
            network: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Remove `addr` from the mesh; subsequent sends fail as unreachable.
    pub fn partition(&self, addr: &str) {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr);
    }

    fn sender(&self, addr: &str) -> Option<mpsc::Sender<Inbound>> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .cloned()
    }
}

/// Outbound half of a [`MemoryNetwork`] endpoint.
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn send(&self, addr: &str, request: Request) -> Result<Response, TransportError> {
        let sender = self.network.sender(addr).ok_or_else(|| TransportError::Unreachable {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "not registered"),
        })?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Inbound {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_network_round_trip() {
        let network = MemoryNetwork::new();
        let (transport, mut inbound) = network.join("a");
        let (_other, _rx) = network.join("b");

        tokio::spawn(async move {
            let rpc = inbound.recv().await.unwrap();
            rpc.reply
                .send(Response::Vote(VoteResponse {
                    term: 3,
                    granted: true,
                }))
                .unwrap();
        });

        // Loop back through our own registration for the test.
        let response = transport
            .send(
                "a",
                Request::Vote(VoteRequest {
                    term: 3,
                    candidate: "b".into(),
                    last_log_index: 0,
                    last_log_term: 0,
                }),
            )
            .await
            .unwrap();
        match response {
            Response::Vote(v) => assert!(v.granted),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_network_unreachable_after_partition() {
        let network = MemoryNetwork::new();
        let (transport, _inbound) = network.join("a");
        network.partition("a");
        let err = transport
            .send(
                "a",
                Request::Vote(VoteRequest {
                    term: 1,
                    candidate: "x".into(),
                    last_log_index: 0,
                    last_log_term: 0,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_tcp_transport_round_trip() {
        let (transport, mut inbound, local) =
            TcpTransport::bind("127.0.0.1:0", Duration::from_secs(1), 2, 8)
                .await
                .unwrap();
        tokio::spawn(async move {
            while let Some(rpc) = inbound.recv().await {
                let term = match &rpc.request {
                    Request::Vote(v) => v.term,
                    _ => 0,
                };
                let _ = rpc.reply.send(Response::Vote(VoteResponse {
                    term,
                    granted: false,
                }));
            }
        });
        let addr = local.to_string();
        let response = transport
            .send(
                &addr,
                Request::Vote(VoteRequest {
                    term: 9,
                    candidate: "c".into(),
                    last_log_index: 1,
                    last_log_term: 1,
                }),
            )
            .await
            .unwrap();
        match response {
            Response::Vote(v) => assert_eq!(v.term, 9),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
