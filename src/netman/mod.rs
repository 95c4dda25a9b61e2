//! Network Manager
//!
//! The thin reconciler between the topology resolver and the drivers: diff
//! the resolved peer set against what is installed, add new peers, update
//! changed ones, delete removed ones, and keep firewall forwarding,
//! masquerade, and mesh DNS in step. One reconcile runs at a time; refresh
//! requests arriving mid-run coalesce into a single trailing pass.

pub mod equality;

pub use self::equality::peers_equal;

use crate::drivers::{DnsDriver, DriverError, FirewallDriver, TunnelDevice, TunnelPeer};
use crate::meshdb::{Feature, MeshDb, MeshDbError, MeshNode};
use crate::negotiate::{NegotiateError, Negotiator};
use crate::topology::{self, PeerDescriptor};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors from the network manager.
#[derive(Debug, Error)]
pub enum NetManError {
    #[error("driver: {0}")]
    Driver(#[from] DriverError),

    #[error("mesh db: {0}")]
    MeshDb(#[from] MeshDbError),

    #[error("negotiate: {0}")]
    Negotiate(#[from] NegotiateError),

    #[error("not started")]
    NotStarted,

    #[error("{} peer(s) failed to reconcile: {}", .0.len(), join_errors(.0))]
    Reconcile(Vec<NetManError>),
}

fn join_errors(errors: &[NetManError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Manager configuration.
#[derive(Clone, Debug, Default)]
pub struct NetManOptions {
    pub node_id: String,
    /// Tunnel listen port.
    pub listen_port: u16,
    pub disable_ipv4: bool,
    pub disable_ipv6: bool,
}

/// What `start` programs onto the device.
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    /// Tunnel private key.
    pub private_key: String,
    pub address_ipv4: Option<ipnet::Ipv4Net>,
    pub address_ipv6: Option<ipnet::Ipv6Net>,
    pub network_ipv4: Option<ipnet::Ipv4Net>,
    pub network_ipv6: Option<ipnet::Ipv6Net>,
}

#[derive(Default)]
struct ManagerState {
    started: bool,
    masquerading: bool,
    installed: HashMap<String, PeerDescriptor>,
    dns_servers: Vec<SocketAddr>,
}

/// Applies resolver output to the tunnel, firewall, and DNS drivers.
pub struct NetworkManager {
    opts: NetManOptions,
    db: MeshDb,
    tunnel: Arc<dyn TunnelDevice>,
    firewall: Arc<dyn FirewallDriver>,
    dns: Arc<dyn DnsDriver>,
    negotiator: Arc<Negotiator>,
    state: Mutex<ManagerState>,
    refresh_pending: AtomicBool,
}

impl NetworkManager {
    pub fn new(
        opts: NetManOptions,
        db: MeshDb,
        tunnel: Arc<dyn TunnelDevice>,
        firewall: Arc<dyn FirewallDriver>,
        dns: Arc<dyn DnsDriver>,
        negotiator: Arc<Negotiator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            opts,
            db,
            tunnel,
            firewall,
            dns,
            negotiator,
            state: Mutex::new(ManagerState::default()),
            refresh_pending: AtomicBool::new(false),
        })
    }

    /// Configure the tunnel device, mesh routes, and forwarding rules.
    pub async fn start(&self, opts: &StartOptions) -> Result<(), NetManError> {
        let mut state = self.state.lock().await;
        self.tunnel
            .configure(&opts.private_key, self.opts.listen_port)
            .await?;
        if !self.opts.disable_ipv6 {
            if let Some(network) = opts.network_ipv6 {
                self.tunnel.add_route(IpNet::V6(network)).await?;
            }
            if let Some(address) = opts.address_ipv6 {
                self.tunnel.add_route(IpNet::V6(address)).await?;
            }
        }
        if !self.opts.disable_ipv4 {
            if let Some(network) = opts.network_ipv4 {
                self.tunnel.add_route(IpNet::V4(network)).await?;
            }
        }
        self.firewall
            .add_tunnel_forwarding(&self.tunnel.name())
            .await?;
        state.started = true;
        info!(iface = %self.tunnel.name(), "network manager started");
        Ok(())
    }

    /// Ensure masquerading is enabled. Idempotent.
    pub async fn start_masquerade(&self) -> Result<(), NetManError> {
        let mut state = self.state.lock().await;
        if state.masquerading {
            return Ok(());
        }
        self.firewall.add_masquerade(&self.tunnel.name()).await?;
        state.masquerading = true;
        Ok(())
    }

    /// Re-resolve the topology and reconcile the device to it.
    ///
    /// Concurrent calls coalesce: whoever holds the manager lock keeps
    /// reconciling while the pending flag is set; everyone else returns
    /// immediately. There is never value in two back-to-back reconciles.
    pub async fn refresh_peers(&self) -> Result<(), NetManError> {
        self.refresh_pending.store(true, Ordering::SeqCst);
        let Ok(mut state) = self.state.try_lock() else {
            return Ok(());
        };
        if !state.started {
            return Ok(());
        }
        let mut result = Ok(());
        while self.refresh_pending.swap(false, Ordering::SeqCst) {
            result = self.reconcile(&mut state).await;
        }
        result
    }

    async fn reconcile(&self, state: &mut ManagerState) -> Result<(), NetManError> {
        let descriptors = topology::resolve(&self.db, &self.opts.node_id)?;
        debug!(peers = descriptors.len(), "reconciling tunnel peers");

        let mut ice_servers: Vec<String> = Vec::new();
        if descriptors.iter().any(|d| d.is_ice()) {
            ice_servers = self.ice_servers()?;
        }
        let tunnel_port = self.tunnel.listen_port().await?;

        let mut errors: Vec<NetManError> = Vec::new();
        let mut seen: HashMap<String, PeerDescriptor> = HashMap::new();
        for descriptor in descriptors {
            let unchanged = state
                .installed
                .get(&descriptor.id)
                .map(|current| peers_equal(current, &descriptor))
                .unwrap_or(false);
            if unchanged {
                seen.insert(descriptor.id.clone(), descriptor);
                continue;
            }
            match self
                .program_peer(&descriptor, &ice_servers, tunnel_port)
                .await
            {
                Ok(()) => {
                    seen.insert(descriptor.id.clone(), descriptor);
                }
                Err(e) => {
                    // One failed peer never blocks the others; it is retried
                    // on the next observation.
                    warn!(peer = %descriptor.id, error = %e, "failed to program peer");
                    errors.push(e);
                }
            }
        }

        // Remove peers no longer in the resolved set.
        for id in self.tunnel.peers().await {
            if seen.contains_key(&id) {
                continue;
            }
            debug!(peer = %id, "removing departed peer");
            self.negotiator.drop_session(&id).await;
            if let Err(e) = self.tunnel.delete_peer(&id).await {
                errors.push(e.into());
            }
        }

        // Keep the unchanged entries plus what we just programmed.
        state
            .installed
            .retain(|id, _| seen.contains_key(id));
        state.installed.extend(seen);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetManError::Reconcile(errors))
        }
    }

    async fn program_peer(
        &self,
        descriptor: &PeerDescriptor,
        ice_servers: &[String],
        tunnel_port: u16,
    ) -> Result<(), NetManError> {
        let endpoint = self
            .negotiator
            .endpoint_for(descriptor, ice_servers, tunnel_port)
            .await?;
        let peer = TunnelPeer {
            id: descriptor.id.clone(),
            public_key: descriptor.public_key.clone(),
            endpoint,
            allowed_ips: self.filter_families(&descriptor.allowed_ips),
            allowed_routes: self.filter_families(&descriptor.allowed_routes),
        };
        self.tunnel.put_peer(&peer).await?;
        Ok(())
    }

    fn filter_families(&self, prefixes: &[IpNet]) -> Vec<IpNet> {
        prefixes
            .iter()
            .filter(|p| match p {
                IpNet::V4(_) => !self.opts.disable_ipv4,
                IpNet::V6(_) => !self.opts.disable_ipv6,
            })
            .copied()
            .collect()
    }

    /// Relay endpoints for ICE negotiation: peers advertising the
    /// ice-negotiation feature, public control address preferred, else
    /// private v4, else private v6.
    fn ice_servers(&self) -> Result<Vec<String>, NetManError> {
        let peers = self.db.peers();
        let mut out = Vec::new();
        for node in peers.list_by_feature(Feature::IceNegotiation)? {
            if node.id == self.opts.node_id {
                continue;
            }
            if let Some(server) = self.control_addr(&node)? {
                out.push(server);
            }
        }
        Ok(out)
    }

    fn control_addr(&self, node: &MeshNode) -> Result<Option<String>, NetManError> {
        if !node.primary_endpoint.is_empty() {
            let host = node
                .primary_endpoint
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(node.primary_endpoint.as_str());
            return Ok(Some(format!("{host}:{}", node.grpc_port)));
        }
        let lease = self.db.peers().lease(&node.id)?;
        if let Some(v4) = lease.as_ref().and_then(|l| l.ipv4) {
            return Ok(Some(format!("{}:{}", v4.addr(), node.grpc_port)));
        }
        if let Some(v6) = lease.as_ref().and_then(|l| l.ipv6) {
            return Ok(Some(format!("[{}]:{}", v6.addr(), node.grpc_port)));
        }
        Ok(None)
    }

    /// Reconfigure system DNS from the peers advertising mesh DNS. New
    /// servers are added before stale ones are removed.
    pub async fn refresh_dns_servers(&self) -> Result<(), NetManError> {
        let mut state = self.state.lock().await;
        if !state.started {
            return Ok(());
        }
        let mut wanted: Vec<SocketAddr> = Vec::new();
        for node in self.db.peers().list_by_feature(Feature::MeshDns)? {
            let port = node.feature_port(Feature::MeshDns).unwrap_or(53);
            let lease = self.db.peers().lease(&node.id)?;
            if !self.opts.disable_ipv4 {
                if let Some(v4) = lease.as_ref().and_then(|l| l.ipv4) {
                    wanted.push(SocketAddr::new(v4.addr().into(), port));
                }
            }
            if !self.opts.disable_ipv6 {
                if let Some(v6) = lease.as_ref().and_then(|l| l.ipv6) {
                    wanted.push(SocketAddr::new(v6.addr().into(), port));
                }
            }
        }
        let to_add: Vec<SocketAddr> = wanted
            .iter()
            .filter(|s| !state.dns_servers.contains(s))
            .copied()
            .collect();
        let to_remove: Vec<SocketAddr> = state
            .dns_servers
            .iter()
            .filter(|s| !wanted.contains(s))
            .copied()
            .collect();
        let iface = self.tunnel.name();
        if !to_add.is_empty() {
            self.dns.add_servers(&iface, &to_add).await?;
        }
        if !to_remove.is_empty() {
            self.dns.remove_servers(&iface, &to_remove).await?;
        }
        state.dns_servers = wanted;
        Ok(())
    }

    /// Currently configured mesh DNS servers.
    pub async fn dns_servers(&self) -> Vec<SocketAddr> {
        self.state.lock().await.dns_servers.clone()
    }

    /// Tear down: firewall rules first, then the tunnel device, then DNS.
    pub async fn close(&self) -> Result<(), NetManError> {
        let mut state = self.state.lock().await;
        if !state.started {
            return Ok(());
        }
        let iface = self.tunnel.name();
        self.negotiator.close().await;
        if let Err(e) = self.firewall.clear().await {
            warn!(error = %e, "failed to clear firewall rules");
        }
        self.tunnel.close().await?;
        if !state.dns_servers.is_empty() {
            if let Err(e) = self.dns.remove_servers(&iface, &state.dns_servers).await {
                warn!(error = %e, "failed to remove DNS servers");
            }
            state.dns_servers.clear();
        }
        state.installed.clear();
        state.started = false;
        info!("network manager closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{MemoryDns, MemoryFirewall, MemoryTunnel};
    use crate::meshdb::{Acl, Edge, FeaturePort, Lease};
    use crate::negotiate::ice::tests_support::EchoRpc;
    use crate::negotiate::{NegotiateOptions, StaticCidrs};
    use crate::storage::MemoryStore;

    struct Harness {
        db: MeshDb,
        tunnel: Arc<MemoryTunnel>,
        firewall: Arc<MemoryFirewall>,
        dns: Arc<MemoryDns>,
        manager: Arc<NetworkManager>,
    }

    async fn harness(node_id: &str) -> Harness {
        let db = MeshDb::local(Arc::new(MemoryStore::new()));
        db.networking()
            .put_acl(&Acl::accept_all("allow-all", 0))
            .await
            .unwrap();
        let tunnel = Arc::new(MemoryTunnel::new());
        let firewall = Arc::new(MemoryFirewall::new());
        let dns = Arc::new(MemoryDns::new());
        let (negotiator, _refresh) = Negotiator::new(
            NegotiateOptions::default(),
            Arc::new(StaticCidrs(vec![])),
            Arc::new(EchoRpc::default()),
        );
        let manager = NetworkManager::new(
            NetManOptions {
                node_id: node_id.to_string(),
                listen_port: 51820,
                ..Default::default()
            },
            db.clone(),
            tunnel.clone(),
            firewall.clone(),
            dns.clone(),
            negotiator,
        );
        manager
            .start(&StartOptions {
                private_key: "priv".into(),
                network_ipv4: Some("172.16.0.0/12".parse().unwrap()),
                network_ipv6: Some("fd00:1:2::/48".parse().unwrap()),
                address_ipv6: Some("fd00:1:2::1/128".parse().unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();
        Harness {
            db,
            tunnel,
            firewall,
            dns,
            manager,
        }
    }

    async fn put_peer(db: &MeshDb, id: &str, host: u32, endpoint: &str) {
        db.peers()
            .put(&crate::meshdb::MeshNode {
                id: id.to_string(),
                public_key: format!("key-{id}"),
                primary_endpoint: endpoint.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        db.peers()
            .put_lease(&Lease {
                node_id: id.to_string(),
                ipv4: Some(format!("172.16.0.{host}/32").parse().unwrap()),
                ipv6: None,
                expires_at: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_programs_routes_and_forwarding() {
        let h = harness("self").await;
        assert_eq!(h.tunnel.routes().len(), 3);
        assert_eq!(h.firewall.rules(), vec!["forward:weft0"]);
    }

    #[tokio::test]
    async fn test_reconcile_adds_updates_and_removes() {
        let h = harness("self").await;
        put_peer(&h.db, "self", 1, "").await;
        put_peer(&h.db, "a", 2, "127.0.0.1:51821").await;
        h.db.peers()
            .put_edge(&Edge {
                a: "self".into(),
                b: "a".into(),
                weight: 1,
                ..Default::default()
            })
            .await
            .unwrap();

        h.manager.refresh_peers().await.unwrap();
        let installed = h.tunnel.installed();
        assert!(installed.contains_key("a"));
        assert_eq!(
            installed["a"].endpoint,
            Some("127.0.0.1:51821".parse().unwrap())
        );
        let puts = h.tunnel.put_count();

        // Unchanged topology: no reprogramming.
        h.manager.refresh_peers().await.unwrap();
        assert_eq!(h.tunnel.put_count(), puts);

        // Lease change: reprogrammed once.
        h.db.peers()
            .put_lease(&Lease {
                node_id: "a".into(),
                ipv4: Some("172.16.0.9/32".parse().unwrap()),
                ipv6: None,
                expires_at: 0,
            })
            .await
            .unwrap();
        h.manager.refresh_peers().await.unwrap();
        assert_eq!(h.tunnel.put_count(), puts + 1);

        // Departed node: removed from the device.
        h.db.peers().delete("a").await.unwrap();
        h.manager.refresh_peers().await.unwrap();
        assert!(h.tunnel.installed().is_empty());
    }

    #[tokio::test]
    async fn test_dns_refresh_tracks_feature() {
        let h = harness("self").await;
        put_peer(&h.db, "dns-node", 5, "").await;
        let mut node = h.db.peers().get("dns-node").unwrap();
        node.features.push(FeaturePort {
            feature: Feature::MeshDns,
            port: 5353,
        });
        h.db.peers().put(&node).await.unwrap();

        h.manager.refresh_dns_servers().await.unwrap();
        let expected: SocketAddr = "172.16.0.5:5353".parse().unwrap();
        assert_eq!(h.dns.servers("weft0"), vec![expected]);
        assert_eq!(h.manager.dns_servers().await, vec![expected]);

        // Feature withdrawn: server removed.
        let mut node = h.db.peers().get("dns-node").unwrap();
        node.features.clear();
        h.db.peers().put(&node).await.unwrap();
        h.manager.refresh_dns_servers().await.unwrap();
        assert!(h.dns.servers("weft0").is_empty());
    }

    #[tokio::test]
    async fn test_masquerade_idempotent() {
        let h = harness("self").await;
        h.manager.start_masquerade().await.unwrap();
        h.manager.start_masquerade().await.unwrap();
        let masq = h
            .firewall
            .rules()
            .iter()
            .filter(|r| r.starts_with("masquerade"))
            .count();
        assert_eq!(masq, 1);
    }

    #[tokio::test]
    async fn test_close_clears_everything() {
        let h = harness("self").await;
        h.manager.close().await.unwrap();
        assert!(h.firewall.rules().is_empty());
        assert!(h.tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_reconcile_errors_are_joined_not_blocking() {
        let h = harness("self").await;
        put_peer(&h.db, "self", 1, "").await;
        put_peer(&h.db, "a", 2, "127.0.0.1:51821").await;
        put_peer(&h.db, "b", 3, "127.0.0.1:51822").await;
        for peer in ["a", "b"] {
            h.db.peers()
                .put_edge(&Edge {
                    a: "self".into(),
                    b: peer.into(),
                    weight: 1,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        // Force the device to reject writes: both peers fail, both errors
        // surface, and the manager survives.
        h.tunnel.close().await.unwrap();
        let err = h.manager.refresh_peers().await.unwrap_err();
        match err {
            NetManError::Reconcile(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
