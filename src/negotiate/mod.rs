//! Connectivity Negotiator
//!
//! Picks the transport for each peer edge: a LAN endpoint when zone
//! awareness says we share a site, the peer's public endpoint otherwise, or
//! a negotiated ICE data channel when NAT blocks both. Each established data
//! channel is owned by one cooperative task; when it closes, a peer-refresh
//! is scheduled so the manager re-enters negotiation if the peer is still in
//! the mesh.

pub mod ice;
pub mod rendezvous;

pub use self::ice::{DataChannelRpc, DataChannelSession, LoopbackForwarder};
pub use self::rendezvous::{DatagramStream, DhtProvider, Rendezvous};

use crate::topology::PeerDescriptor;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Errors from transport negotiation.
#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("no ICE negotiation servers available")]
    NoIceServers,

    #[error("failed to resolve endpoint {endpoint:?}: {source}")]
    Resolve {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("endpoint {0:?} resolved to no addresses")]
    NoAddress(String),

    #[error("negotiation with {peer} via {server} failed: {reason}")]
    Negotiation {
        peer: String,
        server: String,
        reason: String,
    },

    #[error("negotiation timed out")]
    Timeout,

    #[error("negotiator closed")]
    Closed,

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Negotiator tunables.
#[derive(Clone, Debug)]
pub struct NegotiateOptions {
    /// Our zone-awareness tag; empty disables the LAN preference.
    pub zone_awareness_id: String,
    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
    /// Bound on one ICE dial.
    pub dial_timeout: Duration,
    /// Keepalive probe timeout on established channels.
    pub ping_timeout: Duration,
}

impl Default for NegotiateOptions {
    fn default() -> Self {
        Self {
            zone_awareness_id: String::new(),
            disable_ipv4: false,
            disable_ipv6: false,
            dial_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// Source of the CIDRs this host is directly attached to, used by the
/// zone-local preference. Detection is a platform concern, so it sits behind
/// a trait; tests inject a static list.
#[async_trait]
pub trait LocalCidrDetector: Send + Sync {
    async fn detect(&self) -> Result<Vec<IpNet>, NegotiateError>;
}

/// A fixed CIDR list.
pub struct StaticCidrs(pub Vec<IpNet>);

#[async_trait]
impl LocalCidrDetector for StaticCidrs {
    async fn detect(&self) -> Result<Vec<IpNet>, NegotiateError> {
        Ok(self.0.clone())
    }
}

/// Netlink-backed interface address detection.
#[cfg(target_os = "linux")]
pub struct NetlinkDetector {
    /// Interfaces to ignore, typically our own tunnel device.
    pub skip_interfaces: Vec<String>,
}

#[cfg(target_os = "linux")]
#[async_trait]
impl LocalCidrDetector for NetlinkDetector {
    async fn detect(&self) -> Result<Vec<IpNet>, NegotiateError> {
        use futures::TryStreamExt;
        use rtnetlink::packet_route::address::AddressAttribute;
        use rtnetlink::packet_route::link::LinkAttribute;

        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);

        // Interface index -> name, to honor the skip list.
        let mut names: HashMap<u32, String> = HashMap::new();
        let mut links = handle.link().get().execute();
        while let Some(link) = links
            .try_next()
            .await
            .map_err(|e| NegotiateError::Io(std::io::Error::other(e)))?
        {
            for attr in link.attributes {
                if let LinkAttribute::IfName(name) = attr {
                    names.insert(link.header.index, name);
                }
            }
        }

        let mut cidrs = Vec::new();
        let mut addresses = handle.address().get().execute();
        while let Some(message) = addresses
            .try_next()
            .await
            .map_err(|e| NegotiateError::Io(std::io::Error::other(e)))?
        {
            let iface = names.get(&message.header.index);
            if iface.map(|n| self.skip_interfaces.contains(n)).unwrap_or(false) {
                continue;
            }
            let prefix = message.header.prefix_len;
            for attr in message.attributes {
                if let AddressAttribute::Address(addr) = attr {
                    if let Ok(net) = IpNet::new(addr, prefix) {
                        cidrs.push(net.trunc());
                    }
                }
            }
        }
        Ok(cidrs)
    }
}

struct Session {
    local_addr: SocketAddr,
    handle: Box<dyn DataChannelSession>,
}

/// Per-node transport negotiator.
pub struct Negotiator {
    opts: NegotiateOptions,
    detector: Arc<dyn LocalCidrDetector>,
    rpc: Arc<dyn DataChannelRpc>,
    sessions: Mutex<HashMap<String, Session>>,
    refresh_tx: mpsc::UnboundedSender<()>,
}

impl Negotiator {
    /// Create a negotiator. The returned receiver fires whenever an
    /// established data channel closes and the peer set should be
    /// re-reconciled.
    pub fn new(
        opts: NegotiateOptions,
        detector: Arc<dyn LocalCidrDetector>,
        rpc: Arc<dyn DataChannelRpc>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                opts,
                detector,
                rpc,
                sessions: Mutex::new(HashMap::new()),
                refresh_tx,
            }),
            refresh_rx,
        )
    }

    /// Select the endpoint to program for `peer`.
    ///
    /// `Ok(None)` means no endpoint is available but the peering should
    /// still be installed (the peer may dial us).
    pub async fn endpoint_for(
        self: &Arc<Self>,
        peer: &PeerDescriptor,
        ice_servers: &[String],
        tunnel_port: u16,
    ) -> Result<Option<SocketAddr>, NegotiateError> {
        if peer.is_ice() {
            return match self.negotiate_channel(peer, ice_servers, tunnel_port).await {
                Ok(addr) => Ok(Some(addr)),
                // An unreachable relay is non-fatal; the peer may dial us.
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "ICE negotiation unavailable, waiting for inbound");
                    Ok(None)
                }
            };
        }

        // Zone-local preference: any endpoint landing in one of our attached
        // CIDRs wins, the one matching the primary endpoint first.
        if !self.opts.zone_awareness_id.is_empty()
            && peer.zone_awareness_id == self.opts.zone_awareness_id
        {
            if let Some(endpoint) = self.zone_local_endpoint(peer).await? {
                return Ok(Some(endpoint));
            }
        }

        if peer.primary_endpoint.is_empty() {
            return Ok(None);
        }
        let addr = resolve_endpoint(&peer.primary_endpoint).await?;
        Ok(Some(addr))
    }

    async fn zone_local_endpoint(
        &self,
        peer: &PeerDescriptor,
    ) -> Result<Option<SocketAddr>, NegotiateError> {
        let local_cidrs = self.detector.detect().await?;
        if local_cidrs.is_empty() {
            return Ok(None);
        }
        let mut candidates: Vec<(String, SocketAddr)> = Vec::new();
        let mut endpoints: Vec<&String> = Vec::new();
        if !peer.primary_endpoint.is_empty() {
            endpoints.push(&peer.primary_endpoint);
        }
        endpoints.extend(peer.tunnel_endpoints.iter());
        for endpoint in endpoints {
            // Resolution errors fall through to the next candidate.
            match resolve_endpoint(endpoint).await {
                Ok(addr) => {
                    if local_cidrs.iter().any(|cidr| cidr.contains(&addr.ip())) {
                        candidates.push((endpoint.clone(), addr));
                    }
                }
                Err(e) => debug!(endpoint = %endpoint, error = %e, "endpoint resolution failed"),
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }
        let preferred = candidates
            .iter()
            .find(|(raw, _)| raw.starts_with(&peer.primary_endpoint) && !peer.primary_endpoint.is_empty())
            .or_else(|| candidates.first());
        let chosen = preferred.map(|(_, addr)| *addr);
        if let Some(addr) = chosen {
            debug!(peer = %peer.id, endpoint = %addr, "zone awareness shared with peer, using LAN endpoint");
        }
        Ok(chosen)
    }

    /// Negotiate (or reuse) the data channel for `peer`. Only one in-flight
    /// negotiation exists per peer id; later callers get the established
    /// local address.
    async fn negotiate_channel(
        self: &Arc<Self>,
        peer: &PeerDescriptor,
        ice_servers: &[String],
        tunnel_port: u16,
    ) -> Result<SocketAddr, NegotiateError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&peer.id) {
            debug!(peer = %peer.id, local = %session.local_addr, "reusing established data channel");
            return Ok(session.local_addr);
        }
        if ice_servers.is_empty() {
            return Err(NegotiateError::NoIceServers);
        }

        let mut last_err = NegotiateError::NoIceServers;
        for server in ice_servers {
            let dial = self.rpc.negotiate(server, &peer.id, tunnel_port);
            match tokio::time::timeout(self.opts.dial_timeout, dial).await {
                Ok(Ok(handle)) => {
                    let local_addr = handle.local_addr();
                    let mut closed = handle.closed_signal();
                    sessions.insert(
                        peer.id.clone(),
                        Session {
                            local_addr,
                            handle,
                        },
                    );
                    let negotiator = Arc::clone(self);
                    let peer_id = peer.id.clone();
                    tokio::spawn(async move {
                        while !*closed.borrow() {
                            if closed.changed().await.is_err() {
                                break;
                            }
                        }
                        negotiator.sessions.lock().await.remove(&peer_id);
                        debug!(peer = %peer_id, "data channel closed, scheduling peer refresh");
                        let _ = negotiator.refresh_tx.send(());
                    });
                    debug!(peer = %peer.id, server = %server, local = %local_addr, "data channel established");
                    return Ok(local_addr);
                }
                Ok(Err(e)) => last_err = e,
                Err(_) => last_err = NegotiateError::Timeout,
            }
        }
        Err(last_err)
    }

    /// Tear down the data channel for `peer_id`, if any.
    pub async fn drop_session(&self, peer_id: &str) {
        if let Some(session) = self.sessions.lock().await.remove(peer_id) {
            session.handle.close().await;
        }
    }

    /// Number of established data channels.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Close every established data channel.
    pub async fn close(&self) {
        let sessions: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.handle.close().await;
        }
    }
}

/// Resolve a `host:port` endpoint, normalizing v4-mapped-v6 addresses to
/// plain v4.
pub async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, NegotiateError> {
    let mut addrs = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|source| NegotiateError::Resolve {
            endpoint: endpoint.to_string(),
            source,
        })?;
    let addr = addrs
        .next()
        .ok_or_else(|| NegotiateError::NoAddress(endpoint.to_string()))?;
    Ok(normalize(addr))
}

fn normalize(addr: SocketAddr) -> SocketAddr {
    if let IpAddr::V6(v6) = addr.ip() {
        if let Some(v4) = v6.to_ipv4_mapped() {
            return SocketAddr::new(IpAddr::V4(v4), addr.port());
        }
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::ice::tests_support::EchoRpc;
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(id: &str, zone: &str, primary: &str, extra: &[&str]) -> PeerDescriptor {
        PeerDescriptor {
            id: id.to_string(),
            public_key: "pk".to_string(),
            primary_endpoint: primary.to_string(),
            tunnel_endpoints: extra.iter().map(|s| s.to_string()).collect(),
            zone_awareness_id: zone.to_string(),
            proto: "direct".to_string(),
            ..Default::default()
        }
    }

    fn negotiator(zone: &str, cidrs: Vec<IpNet>) -> (Arc<Negotiator>, mpsc::UnboundedReceiver<()>) {
        Negotiator::new(
            NegotiateOptions {
                zone_awareness_id: zone.to_string(),
                dial_timeout: Duration::from_secs(1),
                ..Default::default()
            },
            Arc::new(StaticCidrs(cidrs)),
            Arc::new(EchoRpc::default()),
        )
    }

    #[test]
    fn test_normalize_v4_mapped() {
        let mapped: SocketAddr = "[::ffff:10.1.2.3]:4000".parse().unwrap();
        assert_eq!(
            normalize(mapped),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), 4000)
        );
        let plain: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        assert_eq!(normalize(plain), plain);
    }

    #[tokio::test]
    async fn test_public_endpoint_used_without_zone_match() {
        let (negotiator, _rx) = negotiator("zone-a", vec!["192.168.1.0/24".parse().unwrap()]);
        let peer = peer("p", "zone-b", "127.0.0.1:51820", &["192.168.1.9:51820"]);
        let addr = negotiator
            .endpoint_for(&peer, &[], 51820)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addr, "127.0.0.1:51820".parse().unwrap());
    }

    #[tokio::test]
    async fn test_zone_local_endpoint_preferred() {
        let (negotiator, _rx) = negotiator("zone-a", vec!["127.0.0.0/8".parse().unwrap()]);
        // The additional endpoint is inside our local CIDRs; the primary
        // (unresolvable here) is not.
        let peer = peer("p", "zone-a", "203.0.113.7:51820", &["127.0.0.9:51820"]);
        let addr = negotiator
            .endpoint_for(&peer, &[], 51820)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addr, "127.0.0.9:51820".parse().unwrap());
    }

    #[tokio::test]
    async fn test_nat_bound_peer_has_no_endpoint() {
        let (negotiator, _rx) = negotiator("", vec![]);
        let peer = peer("p", "", "", &[]);
        assert!(negotiator
            .endpoint_for(&peer, &[], 51820)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ice_single_flight() {
        let (negotiator, _rx) = negotiator("", vec![]);
        let mut ice_peer = peer("p", "", "", &[]);
        ice_peer.proto = "ice".to_string();
        let servers = vec!["relay-1:8443".to_string()];

        let first = negotiator
            .endpoint_for(&ice_peer, &servers, 51820)
            .await
            .unwrap()
            .unwrap();
        let second = negotiator
            .endpoint_for(&ice_peer, &servers, 51820)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(negotiator.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_ice_close_triggers_refresh() {
        let (negotiator, mut rx) = negotiator("", vec![]);
        let mut ice_peer = peer("p", "", "", &[]);
        ice_peer.proto = "ice".to_string();
        let servers = vec!["relay-1:8443".to_string()];
        negotiator
            .endpoint_for(&ice_peer, &servers, 51820)
            .await
            .unwrap();
        negotiator.drop_session("p").await;
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("refresh signal after channel close");
        assert_eq!(negotiator.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_ice_unavailable_is_nonfatal() {
        let (negotiator, _rx) = negotiator("", vec![]);
        let mut ice_peer = peer("p", "", "", &[]);
        ice_peer.proto = "ice".to_string();
        // No relay servers: the peer stays installable without an endpoint.
        let endpoint = negotiator
            .endpoint_for(&ice_peer, &[], 51820)
            .await
            .unwrap();
        assert!(endpoint.is_none());
    }
}
