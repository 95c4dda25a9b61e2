//! weft Node
//!
//! Top-level wiring for one process: storage, the replicated log, the
//! allocator, the membership service, the negotiator, the network manager,
//! and the observer loop. A node either bootstraps a new mesh or joins an
//! existing one, then keeps its tunnel reconciled until shutdown.

use crate::allocator::Allocator;
use crate::config::{Config, ConfigError};
use crate::drivers::{
    BuiltinIpam, DnsDriver, DriverError, FirewallDriver, IdentityPlugin, InsecureIdentity,
    IpamDriver, MemoryDns, MemoryFirewall, MemoryTunnel, TunnelDevice,
};
use crate::membership::{
    join_with_retries, Caller, JoinRequest, JoinResponse, JoinRpc, MembershipError,
    MembershipOptions, MembershipService, ObserverHandle,
};
use crate::meshdb::{Group, MeshDb, MeshDbError, Subject};
use crate::negotiate::ice::DataChannelRpc;
use crate::negotiate::{LocalCidrDetector, NegotiateError, Negotiator, StaticCidrs};
use crate::netman::{NetManError, NetManOptions, NetworkManager, StartOptions};
use crate::raft::{Configuration, Raft, RaftError};
use crate::storage::{MemoryStore, SharedStore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default tunnel listen port.
const DEFAULT_TUNNEL_PORT: u16 = 51820;

/// Group holding the nodes allowed to join as voters.
const VOTERS_GROUP: &str = "voters";

/// Inter-attempt backoff base for joins.
const JOIN_BACKOFF: Duration = Duration::from_secs(3);

/// Errors from node startup and shutdown.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("raft: {0}")]
    Raft(#[from] RaftError),

    #[error("mesh db: {0}")]
    MeshDb(#[from] MeshDbError),

    #[error("allocator: {0}")]
    Allocator(#[from] crate::allocator::AllocatorError),

    #[error("membership: {0}")]
    Membership(#[from] MembershipError),

    #[error("network manager: {0}")]
    NetMan(#[from] NetManError),

    #[error("driver: {0}")]
    Driver(#[from] DriverError),

    #[error("negotiate: {0}")]
    Negotiate(#[from] NegotiateError),

    #[error("no leader emerged to bootstrap against")]
    NoLeader,

    #[error("join-address is required when not bootstrapping")]
    MissingJoinAddress,
}

/// The platform drivers and external collaborators a node runs against.
pub struct Drivers {
    pub tunnel: Arc<dyn TunnelDevice>,
    pub firewall: Arc<dyn FirewallDriver>,
    pub dns: Arc<dyn DnsDriver>,
    pub identity: Arc<dyn IdentityPlugin>,
    pub detector: Arc<dyn LocalCidrDetector>,
    pub data_channels: Arc<dyn DataChannelRpc>,
    /// Transport used to reach a remote membership surface when joining.
    pub join_rpc: Option<Arc<dyn JoinRpc>>,
}

impl Drivers {
    /// All-in-memory drivers: no system mutation, insecure identity. For
    /// tests and dry runs.
    pub fn in_memory(data_channels: Arc<dyn DataChannelRpc>) -> Self {
        Self {
            tunnel: Arc::new(MemoryTunnel::new()),
            firewall: Arc::new(MemoryFirewall::new()),
            dns: Arc::new(MemoryDns::new()),
            identity: Arc::new(InsecureIdentity),
            detector: Arc::new(StaticCidrs(Vec::new())),
            data_channels,
            join_rpc: None,
        }
    }
}

/// The tunnel keypair, generated by the platform's key tooling.
#[derive(Clone, Debug)]
pub struct TunnelKey {
    pub private_key: String,
    pub public_key: String,
}

/// A running weft node.
pub struct Node {
    id: String,
    db: MeshDb,
    raft: Raft,
    manager: Arc<NetworkManager>,
    negotiator: Arc<Negotiator>,
    membership: Arc<MembershipService>,
    observer: ObserverHandle,
    refresh_pump: JoinHandle<()>,
    store_sub: crate::storage::SubscriptionId,
    store_pump: JoinHandle<()>,
}

impl Node {
    /// Start a node: open storage, start the replicated log, bootstrap or
    /// join, bring up the tunnel, and spawn the observer loop.
    pub async fn connect(
        config: Config,
        key: TunnelKey,
        drivers: Drivers,
    ) -> Result<Self, NodeError> {
        let id = config.node_id()?;
        let store: SharedStore = Arc::new(MemoryStore::new());
        let raft_options = config.raft.options()?;
        let heartbeat_failure_threshold = raft_options.heartbeat_failure_threshold;

        let bootstrap_config = if config.bootstrap.enabled {
            // The bootstrapping node starts as the sole voter; configured
            // initial voters are admitted through the membership service.
            Some(Configuration::single(id.clone(), "bootstrap"))
        } else {
            None
        };
        let (raft, advertise_addr) = Raft::start(
            id.clone(),
            raft_options,
            Arc::clone(&store),
            bootstrap_config,
        )
        .await?;

        let db = MeshDb::new(store, Arc::new(raft.clone()));
        let allocator = Allocator::new(db.clone());
        let ipam: Arc<dyn IpamDriver> = Arc::new(BuiltinIpam::new(allocator.clone()));
        let (negotiator, refresh_rx) = Negotiator::new(
            config.ice.options(&config.mesh)?,
            Arc::clone(&drivers.detector),
            Arc::clone(&drivers.data_channels),
        );
        let manager = NetworkManager::new(
            NetManOptions {
                node_id: id.clone(),
                listen_port: DEFAULT_TUNNEL_PORT,
                disable_ipv4: config.mesh.no_ipv4,
                disable_ipv6: config.mesh.no_ipv6,
            },
            db.clone(),
            Arc::clone(&drivers.tunnel),
            Arc::clone(&drivers.firewall),
            Arc::clone(&drivers.dns),
            Arc::clone(&negotiator),
        );
        let membership = Arc::new(MembershipService::new(
            db.clone(),
            raft.clone(),
            allocator.clone(),
            ipam,
            MembershipOptions {
                disable_rbac: config.bootstrap.disable_rbac,
                assign_asns: false,
            },
        ));

        let response = if config.bootstrap.enabled {
            Self::bootstrap(
                &config,
                &id,
                &advertise_addr,
                &key,
                &raft,
                &db,
                &allocator,
                &membership,
            )
            .await?
        } else {
            let join_address = config
                .mesh
                .join_address
                .clone()
                .ok_or(NodeError::MissingJoinAddress)?;
            let rpc = drivers
                .join_rpc
                .as_ref()
                .ok_or(NodeError::MissingJoinAddress)?;
            let request = Self::join_request(&config, &id, &advertise_addr, &key)?;
            join_with_retries(
                rpc.as_ref(),
                &join_address,
                &request,
                config.mesh.max_join_retries(),
                JOIN_BACKOFF,
            )
            .await?
        };

        manager
            .start(&StartOptions {
                private_key: key.private_key.clone(),
                address_ipv4: response.address_ipv4,
                address_ipv6: response.address_ipv6,
                network_ipv4: response.network_ipv4,
                network_ipv6: response.network_ipv6,
            })
            .await?;
        if let Err(e) = manager.refresh_peers().await {
            warn!(error = %e, "initial peer refresh failed, retrying on next observation");
        }
        if let Err(e) = manager.refresh_dns_servers().await {
            warn!(error = %e, "initial dns refresh failed");
        }

        let observer = ObserverHandle::spawn(
            raft.clone(),
            db.clone(),
            Arc::clone(&manager),
            heartbeat_failure_threshold,
        );

        // Closed data channels feed back into reconciliation.
        let pump_manager = Arc::clone(&manager);
        let mut refresh_rx = refresh_rx;
        let refresh_pump = tokio::spawn(async move {
            while refresh_rx.recv().await.is_some() {
                if let Err(e) = pump_manager.refresh_peers().await {
                    error!(error = %e, "peer refresh after channel close failed");
                }
            }
        });

        // Committed registry writes drive reconciliation; bursts coalesce
        // behind the manager's pending flag.
        let (store_sub, mut store_events) = db
            .store()
            .subscribe(crate::meshdb::keys::REGISTRY_PREFIX);
        let sub_manager = Arc::clone(&manager);
        let store_pump = tokio::spawn(async move {
            while store_events.recv().await.is_some() {
                if let Err(e) = sub_manager.refresh_peers().await {
                    error!(error = %e, "peer refresh after store update failed");
                }
                if let Err(e) = sub_manager.refresh_dns_servers().await {
                    error!(error = %e, "dns refresh after store update failed");
                }
            }
        });

        info!(node = %id, "mesh node connected");
        Ok(Self {
            id,
            db,
            raft,
            manager,
            negotiator,
            membership,
            observer,
            refresh_pump,
            store_sub,
            store_pump,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn bootstrap(
        config: &Config,
        id: &str,
        advertise_addr: &str,
        key: &TunnelKey,
        raft: &Raft,
        db: &MeshDb,
        allocator: &Allocator,
        membership: &MembershipService,
    ) -> Result<JoinResponse, NodeError> {
        // Wait for the single-voter election to settle.
        let mut elected = false;
        for _ in 0..100 {
            if raft.is_leader().await {
                elected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !elected {
            return Err(NodeError::NoLeader);
        }

        let mut opts = config.bootstrap.options();
        if opts.admin_node_id.is_none() {
            opts.admin_node_id = Some(id.to_string());
        }
        allocator.bootstrap(opts).await?;

        // Record who may join with voter suffrage.
        if !config.bootstrap.initial_voter_ids.is_empty() {
            let mut subjects: Vec<Subject> = config
                .bootstrap
                .initial_voter_ids
                .iter()
                .map(Subject::node)
                .collect();
            subjects.push(Subject::node(id));
            db.rbac()
                .put_group(&Group {
                    name: VOTERS_GROUP.to_string(),
                    subjects,
                })
                .await?;
        }

        // The bootstrapper joins its own mesh through the same path as
        // everyone else.
        let request = Self::join_request(config, id, advertise_addr, key)?;
        Ok(membership.join(&Caller::direct(id), &request).await?)
    }

    fn join_request(
        config: &Config,
        id: &str,
        advertise_addr: &str,
        key: &TunnelKey,
    ) -> Result<JoinRequest, NodeError> {
        Ok(JoinRequest {
            id: id.to_string(),
            public_key: key.public_key.clone(),
            primary_endpoint: config.mesh.primary_endpoint.clone().unwrap_or_default(),
            tunnel_endpoints: Vec::new(),
            zone_awareness_id: config.mesh.zone_awareness_id.clone().unwrap_or_default(),
            features: Vec::new(),
            grpc_port: config.mesh.grpc_advertise_port(),
            raft_addr: advertise_addr.to_string(),
            routes: config.mesh.parsed_routes()?,
            direct_peers: config.mesh.direct_peers.clone(),
            as_voter: config.mesh.join_as_voter && !config.bootstrap.enabled,
            as_observer: config.mesh.join_as_observer && !config.bootstrap.enabled,
            assign_ipv4: !config.mesh.no_ipv4,
            assign_ipv6: !config.mesh.no_ipv6,
        })
    }

    /// This node's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The typed mesh-state views.
    pub fn db(&self) -> &MeshDb {
        &self.db
    }

    /// The replicated log handle.
    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    /// The network manager.
    pub fn manager(&self) -> &Arc<NetworkManager> {
        &self.manager
    }

    /// The membership service, for an RPC surface to serve.
    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    /// Tear down in dependency order: the observer stops emitting, the
    /// network manager closes its drivers, then the replicated log stops
    /// (leaving the configuration first when so configured), then storage
    /// drops with the node.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        info!(node = %self.id, "shutting down");
        self.db.store().unsubscribe(self.store_sub);
        self.store_pump.abort();
        self.observer.stop();
        self.refresh_pump.abort();
        self.negotiator.close().await;
        if let Err(e) = self.manager.close().await {
            warn!(error = %e, "network manager close failed");
        }
        self.raft.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::LeaveRequest;
    use crate::negotiate::ice::tests_support::EchoRpc;
    use async_trait::async_trait;

    fn test_config(id: &str, bootstrap: bool) -> Config {
        let mut config = Config::new();
        config.mesh.node_id = Some(id.to_string());
        config.bootstrap.enabled = bootstrap;
        config.bootstrap.ipv4_network = Some("172.20.0.0/24".parse().unwrap());
        config.bootstrap.ipv6_network = Some("fd00:7:7::/48".parse().unwrap());
        config.bootstrap.disable_rbac = true;
        config.raft.in_memory = true;
        config.raft.listen_address = Some("127.0.0.1:0".to_string());
        config.raft.heartbeat_timeout = Some("150ms".into());
        config.raft.election_timeout = Some("150ms".into());
        config
    }

    fn key(id: &str) -> TunnelKey {
        TunnelKey {
            private_key: format!("priv-{id}"),
            public_key: format!("pub-{id}"),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_lifecycle() {
        let node = Node::connect(
            test_config("first", true),
            key("first"),
            Drivers::in_memory(Arc::new(EchoRpc::default())),
        )
        .await
        .unwrap();

        let state = node.db().mesh_state().get().unwrap().unwrap();
        assert_eq!(state.ipv4_network.to_string(), "172.20.0.0/24");
        assert!(node.db().peers().contains("first").unwrap());
        let lease = node.db().peers().lease("first").unwrap().unwrap();
        assert_eq!(lease.ipv4.unwrap().to_string(), "172.20.0.1/32");

        node.shutdown().await.unwrap();
    }

    /// Joins directly against another node's in-process membership service.
    struct LocalJoin {
        membership: Arc<MembershipService>,
    }

    #[async_trait]
    impl JoinRpc for LocalJoin {
        async fn join(
            &self,
            _addr: &str,
            req: &JoinRequest,
        ) -> Result<JoinResponse, MembershipError> {
            self.membership.join(&Caller::direct(&req.id), req).await
        }
    }

    #[tokio::test]
    async fn test_join_and_leave_against_bootstrapper() {
        let first = Node::connect(
            test_config("first", true),
            key("first"),
            Drivers::in_memory(Arc::new(EchoRpc::default())),
        )
        .await
        .unwrap();

        let mut config = test_config("second", false);
        config.mesh.join_address = Some("in-process".to_string());
        config.mesh.join_as_observer = true;
        config.mesh.direct_peers = vec!["first".to_string()];
        let mut drivers = Drivers::in_memory(Arc::new(EchoRpc::default()));
        drivers.join_rpc = Some(Arc::new(LocalJoin {
            membership: Arc::clone(first.membership()),
        }));

        let second = Node::connect(config, key("second"), drivers).await.unwrap();

        // Both sides agree on membership.
        assert!(first.db().peers().contains("second").unwrap());
        let configuration = first.raft().configuration().await.unwrap();
        assert!(configuration.contains("second"));
        // The requested edge produced a tunnel peering for the joiner.
        let peers = crate::topology::resolve(first.db(), "second").unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "first");

        // Leaving cascades.
        first
            .membership()
            .leave(
                &Caller::direct("second"),
                &LeaveRequest {
                    id: "second".into(),
                },
            )
            .await
            .unwrap();
        assert!(!first.db().peers().contains("second").unwrap());
        assert!(!first
            .raft()
            .configuration()
            .await
            .unwrap()
            .contains("second"));

        second.shutdown().await.unwrap();
        first.shutdown().await.unwrap();
    }
}
