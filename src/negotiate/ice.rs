//! ICE Data-Channel Plumbing
//!
//! The negotiated transport for NAT-blocked peers. The signaling path (offer,
//! answer, candidate exchange through a relay node) is an external
//! collaborator behind [`DataChannelRpc`]; what the core owns is the local
//! end: a loopback UDP socket the tunnel driver treats as the peer's
//! endpoint, with datagrams pumped between that socket and the channel.

use super::NegotiateError;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Largest datagram carried over a channel.
const MAX_DATAGRAM: usize = 65_535;

/// Signaling collaborator: negotiates a data channel to `peer_id` through
/// the relay at `server` and returns the established session.
#[async_trait]
pub trait DataChannelRpc: Send + Sync {
    async fn negotiate(
        &self,
        server: &str,
        peer_id: &str,
        tunnel_port: u16,
    ) -> Result<Box<dyn DataChannelSession>, NegotiateError>;
}

/// An established data channel.
#[async_trait]
pub trait DataChannelSession: Send + Sync {
    /// Loopback address handed to the tunnel driver as the peer endpoint.
    fn local_addr(&self) -> SocketAddr;

    /// Flips to `true` once the channel has closed.
    fn closed_signal(&self) -> watch::Receiver<bool>;

    /// Close the channel.
    async fn close(&self);
}

/// The local end of a data channel: a loopback UDP socket bridged to the
/// channel's byte stream.
///
/// Outbound: datagrams the tunnel sends to [`local_addr`](Self::local_addr)
/// are pushed into `channel_tx`. Inbound: datagrams arriving on `channel_rx`
/// are delivered to the tunnel's own listen port.
pub struct LoopbackForwarder {
    local_addr: SocketAddr,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackForwarder {
    /// Bind the loopback socket and start the pump.
    pub async fn start(
        tunnel_port: u16,
        channel_tx: mpsc::Sender<Vec<u8>>,
        mut channel_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Arc<Self>, NegotiateError> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?);
        let local_addr = socket.local_addr()?;
        let (closed_tx, closed_rx) = watch::channel(false);
        let tunnel_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, tunnel_port));

        let pump_socket = Arc::clone(&socket);
        let pump_closed = closed_tx.clone();
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    received = pump_socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, from)) => {
                                trace!(len, %from, "tunnel -> channel");
                                if channel_tx.send(buf[..len].to_vec()).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "loopback socket receive failed");
                                break;
                            }
                        }
                    }
                    inbound = channel_rx.recv() => {
                        match inbound {
                            Some(data) => {
                                trace!(len = data.len(), "channel -> tunnel");
                                if let Err(e) = pump_socket.send_to(&data, tunnel_addr).await {
                                    debug!(error = %e, "loopback socket send failed");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            let _ = pump_closed.send(true);
        });

        Ok(Arc::new(Self {
            local_addr,
            closed_tx,
            closed_rx,
            pump: Mutex::new(Some(pump)),
        }))
    }
}

#[async_trait]
impl DataChannelSession for LoopbackForwarder {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    async fn close(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        let _ = self.closed_tx.send(true);
    }
}

#[async_trait]
impl<T: DataChannelSession + ?Sized> DataChannelSession for Arc<T> {
    fn local_addr(&self) -> SocketAddr {
        (**self).local_addr()
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        (**self).closed_signal()
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Test support: an RPC whose channels echo every datagram back.
#[cfg(test)]
pub mod tests_support {
    use super::*;

    #[derive(Default)]
    pub struct EchoRpc;

    #[async_trait]
    impl DataChannelRpc for EchoRpc {
        async fn negotiate(
            &self,
            _server: &str,
            _peer_id: &str,
            tunnel_port: u16,
        ) -> Result<Box<dyn DataChannelSession>, NegotiateError> {
            let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(16);
            let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(16);
            tokio::spawn(async move {
                while let Some(datagram) = out_rx.recv().await {
                    if in_tx.send(datagram).await.is_err() {
                        break;
                    }
                }
            });
            let forwarder = LoopbackForwarder::start(tunnel_port, out_tx, in_rx).await?;
            Ok(Box::new(forwarder))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_forwarder_round_trip() {
        // Simulated tunnel socket.
        let tunnel = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let tunnel_port = tunnel.local_addr().unwrap().port();

        // Echo channel: everything sent comes back.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(16);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(16);
        tokio::spawn(async move {
            while let Some(d) = out_rx.recv().await {
                if in_tx.send(d).await.is_err() {
                    break;
                }
            }
        });

        let forwarder = LoopbackForwarder::start(tunnel_port, out_tx, in_rx)
            .await
            .unwrap();
        tunnel
            .send_to(b"ping", forwarder.local_addr())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), tunnel.recv_from(&mut buf))
            .await
            .expect("echoed datagram")
            .unwrap();
        assert_eq!(&buf[..len], b"ping");
    }

    #[tokio::test]
    async fn test_close_flips_signal() {
        let (out_tx, _out_rx) = mpsc::channel::<Vec<u8>>(1);
        let (_in_tx, in_rx) = mpsc::channel::<Vec<u8>>(1);
        let forwarder = LoopbackForwarder::start(0, out_tx, in_rx).await.unwrap();
        let mut closed = forwarder.closed_signal();
        assert!(!*closed.borrow());
        forwarder.close().await;
        closed.changed().await.unwrap();
        assert!(*closed.borrow());
    }
}
