//! Collaborator Driver Interfaces
//!
//! The seams between the core and the platform: the encrypted tunnel device,
//! firewall, system DNS, identity authentication, and address management.
//! The core consumes these traits; real implementations live outside the
//! crate. The in-memory implementations here back tests and dry runs.

use crate::allocator::{Allocator, AllocatorError};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use thiserror::Error;

/// Errors surfaced by drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver closed")]
    Closed,

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("address exhausted: {0}")]
    Exhausted(String),

    #[error("{0}")]
    Failed(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AllocatorError> for DriverError {
    fn from(e: AllocatorError) -> Self {
        match e {
            AllocatorError::Exhausted(subnet) => DriverError::Exhausted(subnet),
            AllocatorError::AsnExhausted => DriverError::Exhausted("asn range".to_string()),
            other => DriverError::Failed(other.to_string()),
        }
    }
}

// ============================================================================
// Tunnel device
// ============================================================================

/// A peer as programmed into the tunnel device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelPeer {
    pub id: String,
    pub public_key: String,
    /// Resolved endpoint; `None` while waiting for the peer to dial us.
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub allowed_routes: Vec<IpNet>,
}

/// The kernel-or-userspace encrypted tunnel device.
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Interface name, for firewall and DNS scoping.
    fn name(&self) -> String;

    /// Apply the local private key and listen port.
    async fn configure(&self, private_key: &str, listen_port: u16) -> Result<(), DriverError>;

    /// The bound listen port.
    async fn listen_port(&self) -> Result<u16, DriverError>;

    /// Install a system route for `prefix` toward the device.
    async fn add_route(&self, prefix: IpNet) -> Result<(), DriverError>;

    /// Install or update a peer.
    async fn put_peer(&self, peer: &TunnelPeer) -> Result<(), DriverError>;

    /// Remove a peer by id.
    async fn delete_peer(&self, id: &str) -> Result<(), DriverError>;

    /// Ids of currently installed peers.
    async fn peers(&self) -> HashSet<String>;

    /// Tear the device down.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Records tunnel programming without touching the system.
#[derive(Default)]
pub struct MemoryTunnel {
    state: Mutex<MemoryTunnelState>,
}

#[derive(Default)]
struct MemoryTunnelState {
    configured_key: Option<String>,
    listen_port: u16,
    routes: Vec<IpNet>,
    peers: HashMap<String, TunnelPeer>,
    put_count: usize,
    closed: bool,
}

impl MemoryTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently installed peer set.
    pub fn installed(&self) -> HashMap<String, TunnelPeer> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .clone()
    }

    /// Number of `put_peer` calls observed; reconcile tests assert on it.
    pub fn put_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put_count
    }

    /// Installed system routes.
    pub fn routes(&self) -> Vec<IpNet> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .routes
            .clone()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }
}

#[async_trait]
impl TunnelDevice for MemoryTunnel {
    fn name(&self) -> String {
        "weft0".to_string()
    }

    async fn configure(&self, private_key: &str, listen_port: u16) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.configured_key = Some(private_key.to_string());
        state.listen_port = listen_port;
        Ok(())
    }

    async fn listen_port(&self) -> Result<u16, DriverError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listen_port)
    }

    async fn add_route(&self, prefix: IpNet) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.routes.contains(&prefix) {
            state.routes.push(prefix);
        }
        Ok(())
    }

    async fn put_peer(&self, peer: &TunnelPeer) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(DriverError::Closed);
        }
        state.put_count += 1;
        state.peers.insert(peer.id.clone(), peer.clone());
        Ok(())
    }

    async fn delete_peer(&self, id: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.peers.remove(id);
        Ok(())
    }

    async fn peers(&self) -> HashSet<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .keys()
            .cloned()
            .collect()
    }

    async fn close(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.peers.clear();
        Ok(())
    }
}

// ============================================================================
// Firewall
// ============================================================================

/// Firewall mutations the reconciler performs.
#[async_trait]
pub trait FirewallDriver: Send + Sync {
    /// Allow forwarding across the tunnel interface.
    async fn add_tunnel_forwarding(&self, iface: &str) -> Result<(), DriverError>;

    /// Masquerade traffic leaving through `iface`.
    async fn add_masquerade(&self, iface: &str) -> Result<(), DriverError>;

    /// Drop every rule this driver installed.
    async fn clear(&self) -> Result<(), DriverError>;
}

/// Records firewall rules without touching the system.
#[derive(Default)]
pub struct MemoryFirewall {
    rules: Mutex<Vec<String>>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> Vec<String> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl FirewallDriver for MemoryFirewall {
    async fn add_tunnel_forwarding(&self, iface: &str) -> Result<(), DriverError> {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("forward:{iface}"));
        Ok(())
    }

    async fn add_masquerade(&self, iface: &str) -> Result<(), DriverError> {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("masquerade:{iface}"));
        Ok(())
    }

    async fn clear(&self) -> Result<(), DriverError> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

// ============================================================================
// DNS
// ============================================================================

/// System DNS configuration scoped to an interface.
#[async_trait]
pub trait DnsDriver: Send + Sync {
    async fn add_servers(&self, iface: &str, servers: &[SocketAddr]) -> Result<(), DriverError>;
    async fn remove_servers(&self, iface: &str, servers: &[SocketAddr]) -> Result<(), DriverError>;
}

/// Records DNS server changes without touching the system.
#[derive(Default)]
pub struct MemoryDns {
    servers: Mutex<HashMap<String, Vec<SocketAddr>>>,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn servers(&self, iface: &str) -> Vec<SocketAddr> {
        self.servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(iface)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DnsDriver for MemoryDns {
    async fn add_servers(&self, iface: &str, servers: &[SocketAddr]) -> Result<(), DriverError> {
        let mut all = self.servers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = all.entry(iface.to_string()).or_default();
        for server in servers {
            if !entry.contains(server) {
                entry.push(*server);
            }
        }
        Ok(())
    }

    async fn remove_servers(&self, iface: &str, servers: &[SocketAddr]) -> Result<(), DriverError> {
        let mut all = self.servers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = all.get_mut(iface) {
            entry.retain(|s| !servers.contains(s));
        }
        Ok(())
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Authenticates a caller from its claimed id and opaque credentials.
pub trait IdentityPlugin: Send + Sync {
    fn authenticate(
        &self,
        claimed_id: &str,
        credentials: &BTreeMap<String, String>,
    ) -> Result<String, DriverError>;
}

/// Trusts the claimed id. For closed networks and tests.
#[derive(Default)]
pub struct InsecureIdentity;

impl IdentityPlugin for InsecureIdentity {
    fn authenticate(
        &self,
        claimed_id: &str,
        _credentials: &BTreeMap<String, String>,
    ) -> Result<String, DriverError> {
        if claimed_id.is_empty() {
            return Err(DriverError::Unauthenticated("empty id".to_string()));
        }
        Ok(claimed_id.to_string())
    }
}

// ============================================================================
// IPAM
// ============================================================================

/// Address family selector for IPAM plugins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Pluggable address management. The default implementation is the built-in
/// allocator.
#[async_trait]
pub trait IpamDriver: Send + Sync {
    async fn allocate(
        &self,
        node_id: &str,
        subnet: IpNet,
        family: AddressFamily,
    ) -> Result<IpNet, DriverError>;

    async fn release(&self, node_id: &str) -> Result<(), DriverError>;
}

/// IPAM backed by the built-in lease allocator.
pub struct BuiltinIpam {
    allocator: Allocator,
}

impl BuiltinIpam {
    pub fn new(allocator: Allocator) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl IpamDriver for BuiltinIpam {
    async fn allocate(
        &self,
        node_id: &str,
        subnet: IpNet,
        family: AddressFamily,
    ) -> Result<IpNet, DriverError> {
        match (family, subnet) {
            (AddressFamily::Ipv4, IpNet::V4(subnet)) => Ok(IpNet::V4(
                self.allocator.allocate_ipv4(node_id, subnet).await?,
            )),
            (AddressFamily::Ipv6, IpNet::V6(subnet)) => Ok(IpNet::V6(
                self.allocator.allocate_ipv6(node_id, subnet).await?,
            )),
            _ => Err(DriverError::Failed(format!(
                "subnet {subnet} does not match requested family"
            ))),
        }
    }

    async fn release(&self, node_id: &str) -> Result<(), DriverError> {
        Ok(self.allocator.release(node_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_tunnel_tracks_peers() {
        let tunnel = MemoryTunnel::new();
        tunnel.configure("priv", 51820).await.unwrap();
        assert_eq!(tunnel.listen_port().await.unwrap(), 51820);
        tunnel
            .put_peer(&TunnelPeer {
                id: "a".into(),
                public_key: "pk".into(),
                endpoint: None,
                allowed_ips: vec![],
                allowed_routes: vec![],
            })
            .await
            .unwrap();
        assert!(tunnel.peers().await.contains("a"));
        tunnel.delete_peer("a").await.unwrap();
        assert!(tunnel.peers().await.is_empty());
    }

    #[test]
    fn test_insecure_identity_requires_id() {
        let identity = InsecureIdentity;
        assert_eq!(
            identity.authenticate("n1", &BTreeMap::new()).unwrap(),
            "n1"
        );
        assert!(identity.authenticate("", &BTreeMap::new()).is_err());
    }
}
