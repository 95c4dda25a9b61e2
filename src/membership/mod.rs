//! Membership Service
//!
//! Turns authenticated join and leave requests into mesh-state mutations on
//! the leader: lease allocation, node upsert, requested edges, policy-checked
//! route advertisements, and the raft configuration change. Non-leaders fail
//! with the current leader's address so the transport surface can forward.
//!
//! The RPC surface itself (gRPC or otherwise) is an external collaborator;
//! this module is transport-agnostic and receives already-authenticated
//! callers.

pub mod observer;

pub use self::observer::{ObserverHandle, WatchEvent};

use crate::allocator::{Allocator, AllocatorError, DEFAULT_ASN_RANGE};
use crate::drivers::{AddressFamily, DriverError, IpamDriver};
use crate::meshdb::{
    Edge, FeaturePort, Feature, MeshDb, MeshDbError, MeshNode, Right, Route,
};
use crate::raft::{Raft, RaftError};
use crate::topology::{self, PeerDescriptor};
use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Barrier wait after removing a raft server on leave.
const LEAVE_BARRIER_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors mapped to the transport codes of the membership surface.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("not the leader{}", .leader.as_deref().map(|l| format!(" (leader: {l})")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl From<RaftError> for MembershipError {
    fn from(e: RaftError) -> Self {
        match e {
            RaftError::NotLeader { leader } => MembershipError::NotLeader { leader },
            RaftError::Timeout => MembershipError::DeadlineExceeded,
            RaftError::Aborted => MembershipError::Unavailable("log closed".to_string()),
            RaftError::ConfigurationPending => MembershipError::FailedPrecondition(
                "a configuration change is already in flight".to_string(),
            ),
            other => MembershipError::Internal(other.to_string()),
        }
    }
}

impl From<MeshDbError> for MembershipError {
    fn from(e: MeshDbError) -> Self {
        match e {
            MeshDbError::NotFound { kind, name } => {
                MembershipError::NotFound(format!("{kind} {name:?}"))
            }
            MeshDbError::InvalidArgument(msg) => MembershipError::InvalidArgument(msg),
            MeshDbError::InvalidRecord { key, .. } => {
                MembershipError::Internal(format!("corrupt record at {key}"))
            }
            MeshDbError::Storage(e) => MembershipError::Unavailable(e.to_string()),
            MeshDbError::Raft(e) => e.into(),
        }
    }
}

impl From<AllocatorError> for MembershipError {
    fn from(e: AllocatorError) -> Self {
        match e {
            AllocatorError::Exhausted(subnet) => {
                MembershipError::Conflict(format!("subnet {subnet} exhausted"))
            }
            AllocatorError::AsnExhausted => {
                MembershipError::Conflict("ASN range exhausted".to_string())
            }
            AllocatorError::NotBootstrapped => {
                MembershipError::FailedPrecondition("mesh is not bootstrapped".to_string())
            }
            AllocatorError::MeshDb(e) => e.into(),
        }
    }
}

impl From<DriverError> for MembershipError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Unauthenticated(msg) => MembershipError::PermissionDenied(msg),
            DriverError::Exhausted(what) => MembershipError::Conflict(format!("{what} exhausted")),
            other => MembershipError::Internal(other.to_string()),
        }
    }
}

/// An authenticated caller. `proxied_for` is set when the leader proxy
/// forwarded the request on behalf of another node.
#[derive(Clone, Debug)]
pub struct Caller {
    pub id: String,
    pub proxied_for: Option<String>,
}

impl Caller {
    pub fn direct(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            proxied_for: None,
        }
    }

    fn effective_id(&self) -> &str {
        self.proxied_for.as_deref().unwrap_or(&self.id)
    }
}

/// A join request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub public_key: String,
    #[serde(default)]
    pub primary_endpoint: String,
    #[serde(default)]
    pub tunnel_endpoints: Vec<String>,
    #[serde(default)]
    pub zone_awareness_id: String,
    #[serde(default)]
    pub features: Vec<FeaturePort>,
    #[serde(default)]
    pub grpc_port: u16,
    #[serde(default)]
    pub raft_addr: String,
    /// Prefixes this node wants to advertise. Requires the routes right.
    #[serde(default)]
    pub routes: Vec<IpNet>,
    /// Nodes this node wants direct tunnel edges to.
    #[serde(default)]
    pub direct_peers: Vec<String>,
    #[serde(default)]
    pub as_voter: bool,
    #[serde(default)]
    pub as_observer: bool,
    /// Family preferences; both default on.
    #[serde(default = "default_true")]
    pub assign_ipv4: bool,
    #[serde(default = "default_true")]
    pub assign_ipv6: bool,
}

fn default_true() -> bool {
    true
}

/// A join response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JoinResponse {
    pub address_ipv4: Option<ipnet::Ipv4Net>,
    pub address_ipv6: Option<ipnet::Ipv6Net>,
    pub network_ipv4: Option<ipnet::Ipv4Net>,
    pub network_ipv6: Option<ipnet::Ipv6Net>,
    pub mesh_domain: String,
    pub peers: Vec<PeerDescriptor>,
    pub ice_servers: Vec<String>,
    pub dns_servers: Vec<String>,
}

/// A leave request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub id: String,
}

/// Service options.
#[derive(Clone, Debug, Default)]
pub struct MembershipOptions {
    pub disable_rbac: bool,
    /// Assign an ASN to joining nodes.
    pub assign_asns: bool,
}

/// The leader-side membership service.
pub struct MembershipService {
    db: MeshDb,
    raft: Raft,
    allocator: Allocator,
    ipam: Arc<dyn IpamDriver>,
    opts: MembershipOptions,
}

impl MembershipService {
    pub fn new(
        db: MeshDb,
        raft: Raft,
        allocator: Allocator,
        ipam: Arc<dyn IpamDriver>,
        opts: MembershipOptions,
    ) -> Self {
        Self {
            db,
            raft,
            allocator,
            ipam,
            opts,
        }
    }

    /// Handle a join. Leader only; followers fail `NotLeader` with the
    /// current leader's address for forwarding.
    pub async fn join(
        &self,
        caller: &Caller,
        req: &JoinRequest,
    ) -> Result<JoinResponse, MembershipError> {
        if req.id.is_empty() {
            return Err(MembershipError::InvalidArgument("id is required".into()));
        }
        if caller.effective_id() != req.id {
            return Err(MembershipError::PermissionDenied(format!(
                "caller {:?} cannot join as {:?}",
                caller.effective_id(),
                req.id
            )));
        }
        self.require_leader().await?;
        let state = self
            .db
            .mesh_state()
            .get()?
            .ok_or_else(|| {
                MembershipError::FailedPrecondition("cluster is not bootstrapped".into())
            })?;
        info!(node = %req.id, voter = req.as_voter, observer = req.as_observer, "handling join");

        // Address leases, per family preference.
        let mut address_ipv4 = None;
        let mut address_ipv6 = None;
        // The node record must exist before its lease can.
        self.upsert_node(req).await?;
        if req.assign_ipv4 {
            let allocated = self
                .ipam
                .allocate(&req.id, IpNet::V4(state.ipv4_network), AddressFamily::Ipv4)
                .await?;
            if let IpNet::V4(prefix) = allocated {
                address_ipv4 = Some(prefix);
            }
        }
        if req.assign_ipv6 {
            let allocated = self
                .ipam
                .allocate(&req.id, IpNet::V6(state.ipv6_network), AddressFamily::Ipv6)
                .await?;
            if let IpNet::V6(prefix) = allocated {
                address_ipv6 = Some(prefix);
            }
        }
        if self.opts.assign_asns {
            self.allocator
                .allocate_asn(&req.id, DEFAULT_ASN_RANGE)
                .await?;
        }

        // Requested direct edges; unknown peers are skipped.
        for peer in &req.direct_peers {
            if peer == &req.id {
                continue;
            }
            if !self.db.peers().contains(peer)? {
                debug!(node = %req.id, peer = %peer, "requested direct peer does not exist, skipping");
                continue;
            }
            let mut edge = Edge {
                a: req.id.clone(),
                b: peer.clone(),
                weight: 1,
                ..Default::default()
            };
            edge.attrs.insert(
                crate::meshdb::peers::EDGE_ATTR_PROTO.to_string(),
                "direct".to_string(),
            );
            self.db.peers().put_edge(&edge).await?;
        }

        // Requested routes are policy-checked.
        if !req.routes.is_empty() {
            if !self.opts.disable_rbac
                && !self
                    .db
                    .rbac()
                    .can(caller.effective_id(), Right::PutRoutes)?
            {
                return Err(MembershipError::PermissionDenied(format!(
                    "{:?} may not advertise routes",
                    caller.effective_id()
                )));
            }
            self.db
                .networking()
                .put_route(&Route {
                    name: format!("{}-auto", req.id),
                    node_id: req.id.clone(),
                    destination_cidrs: req.routes.clone(),
                })
                .await?;
        }

        // Raft membership, when requested.
        if req.as_voter || req.as_observer {
            if req.raft_addr.is_empty() {
                return Err(MembershipError::InvalidArgument(
                    "raft address is required to join as voter or observer".into(),
                ));
            }
            if req.as_voter {
                self.raft.add_voter(&req.id, &req.raft_addr).await?;
            } else {
                self.raft.add_observer(&req.id, &req.raft_addr).await?;
            }
        }

        let peers = topology::resolve(&self.db, &req.id)?;
        Ok(JoinResponse {
            address_ipv4,
            address_ipv6,
            network_ipv4: Some(state.ipv4_network),
            network_ipv6: Some(state.ipv6_network),
            mesh_domain: state.domain,
            peers,
            ice_servers: self.ice_servers()?,
            dns_servers: self.dns_servers()?,
        })
    }

    /// Handle a leave. The caller must prove it is the named node, directly
    /// or through the leader proxy.
    pub async fn leave(&self, caller: &Caller, req: &LeaveRequest) -> Result<(), MembershipError> {
        if req.id.is_empty() {
            return Err(MembershipError::InvalidArgument("id is required".into()));
        }
        if caller.effective_id() != req.id {
            return Err(MembershipError::PermissionDenied(format!(
                "caller {:?} cannot leave as {:?}",
                caller.effective_id(),
                req.id
            )));
        }
        self.require_leader().await?;
        info!(node = %req.id, "handling leave");

        let configuration = self.raft.configuration().await?;
        if configuration.contains(&req.id) {
            self.raft.remove_server(&req.id).await?;
            // Sync the cluster before tearing down the node record.
            self.raft.barrier(LEAVE_BARRIER_TIMEOUT).await?;
        }
        self.db.peers().delete(&req.id).await?;
        Ok(())
    }

    async fn require_leader(&self) -> Result<(), MembershipError> {
        let status = self.raft.status().await?;
        if status.role != crate::raft::Role::Leader {
            return Err(MembershipError::NotLeader {
                leader: status.leader_addr,
            });
        }
        Ok(())
    }

    async fn upsert_node(&self, req: &JoinRequest) -> Result<(), MembershipError> {
        let joined_at = match self.db.peers().get(&req.id) {
            Ok(existing) => existing.joined_at,
            Err(MeshDbError::NotFound { .. }) => now_unix(),
            Err(e) => return Err(e.into()),
        };
        self.db
            .peers()
            .put(&MeshNode {
                id: req.id.clone(),
                public_key: req.public_key.clone(),
                primary_endpoint: req.primary_endpoint.clone(),
                tunnel_endpoints: req.tunnel_endpoints.clone(),
                zone_awareness_id: req.zone_awareness_id.clone(),
                features: req.features.clone(),
                grpc_port: req.grpc_port,
                raft_addr: req.raft_addr.clone(),
                joined_at,
            })
            .await?;
        Ok(())
    }

    /// Relay endpoints offered to joiners: ice-negotiation peers by public
    /// control address, else private v4, else private v6.
    fn ice_servers(&self) -> Result<Vec<String>, MembershipError> {
        let mut out = Vec::new();
        for node in self.db.peers().list_by_feature(Feature::IceNegotiation)? {
            if !node.primary_endpoint.is_empty() {
                let host = node
                    .primary_endpoint
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(node.primary_endpoint.as_str());
                out.push(format!("{host}:{}", node.grpc_port));
                continue;
            }
            let lease = self.db.peers().lease(&node.id)?;
            if let Some(v4) = lease.as_ref().and_then(|l| l.ipv4) {
                out.push(format!("{}:{}", v4.addr(), node.grpc_port));
            } else if let Some(v6) = lease.as_ref().and_then(|l| l.ipv6) {
                out.push(format!("[{}]:{}", v6.addr(), node.grpc_port));
            }
        }
        Ok(out)
    }

    /// Mesh DNS servers offered to joiners.
    fn dns_servers(&self) -> Result<Vec<String>, MembershipError> {
        let mut out = Vec::new();
        for node in self.db.peers().list_by_feature(Feature::MeshDns)? {
            let port = node.feature_port(Feature::MeshDns).unwrap_or(53);
            let lease = self.db.peers().lease(&node.id)?;
            if let Some(v4) = lease.as_ref().and_then(|l| l.ipv4) {
                out.push(format!("{}:{port}", v4.addr()));
            }
            if let Some(v6) = lease.as_ref().and_then(|l| l.ipv6) {
                out.push(format!("[{}]:{port}", v6.addr()));
            }
        }
        Ok(out)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Join client
// ============================================================================

/// Transport used by a joining node to reach the membership surface.
#[async_trait]
pub trait JoinRpc: Send + Sync {
    async fn join(&self, addr: &str, req: &JoinRequest)
        -> Result<JoinResponse, MembershipError>;
}

/// Join with retries: `NotLeader` redirects to the reported leader, transient
/// failures back off linearly, and the retry count is capped.
pub async fn join_with_retries(
    rpc: &dyn JoinRpc,
    join_addr: &str,
    req: &JoinRequest,
    max_retries: u32,
    backoff: Duration,
) -> Result<JoinResponse, MembershipError> {
    let mut addr = join_addr.to_string();
    let mut last = MembershipError::Unavailable("no join attempts made".to_string());
    for attempt in 0..max_retries.max(1) {
        match rpc.join(&addr, req).await {
            Ok(response) => return Ok(response),
            Err(MembershipError::NotLeader {
                leader: Some(leader),
            }) if leader != addr => {
                debug!(leader = %leader, "redirected to leader");
                addr = leader;
                last = MembershipError::NotLeader { leader: None };
            }
            Err(
                e @ (MembershipError::Unavailable(_)
                | MembershipError::DeadlineExceeded
                | MembershipError::NotLeader { .. }),
            ) => {
                warn!(attempt, error = %e, "join attempt failed, backing off");
                last = e;
                tokio::time::sleep(backoff * (attempt + 1)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}
