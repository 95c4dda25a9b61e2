//! Rendezvous Packet Relay
//!
//! Optional DHT-brokered relay for meshes with no reachable ICE servers.
//! Both ends derive a rendezvous key from the shared PSK, publish a
//! peer-keyed handler through the provider, and stream datagrams
//! bidirectionally between a local UDP socket and the provider's duplex
//! stream. The DHT itself is an external collaborator.

use super::NegotiateError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Largest relayed datagram.
const MAX_DATAGRAM: usize = 65_535;

/// A duplex datagram stream to the remote rendezvous end.
#[async_trait]
pub trait DatagramStream: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), NegotiateError>;

    /// `None` once the stream is closed.
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

/// DHT collaborator: opens the duplex stream registered under
/// `rendezvous_key`.
#[async_trait]
pub trait DhtProvider: Send + Sync {
    async fn open(&self, rendezvous_key: &str) -> Result<Box<dyn DatagramStream>, NegotiateError>;
}

/// Derive the rendezvous key from the mesh PSK.
pub fn rendezvous_key(psk: &str) -> String {
    let digest = Sha256::digest(psk.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// A running rendezvous relay.
pub struct Rendezvous {
    local_addr: SocketAddr,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Rendezvous {
    /// Derive the key from `psk`, open the provider stream, and start
    /// relaying between it and a fresh loopback UDP socket.
    pub async fn start(
        psk: &str,
        provider: &dyn DhtProvider,
        tunnel_port: u16,
    ) -> Result<Arc<Self>, NegotiateError> {
        let key = rendezvous_key(psk);
        let mut stream = provider.open(&key).await?;
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?);
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "rendezvous relay started");

        let tunnel_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, tunnel_port));
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, _)) => {
                                if stream.send(&buf[..len]).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "rendezvous socket receive failed");
                                break;
                            }
                        }
                    }
                    inbound = stream.recv() => {
                        match inbound {
                            Some(data) => {
                                if socket.send_to(&data, tunnel_addr).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            debug!("rendezvous relay stopped");
        });

        Ok(Arc::new(Self {
            local_addr,
            pump: Mutex::new(Some(pump)),
        }))
    }

    /// The loopback address the tunnel driver should use as the peer
    /// endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop relaying.
    pub async fn close(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
    }
}
