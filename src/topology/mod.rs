//! Topology Resolver
//!
//! The pure function at the center of the mesh: given the current state and
//! a requesting node, produce the exact set of tunnel peers that node must
//! install, each with its allowed-IP and allowed-route sets.
//!
//! Each direct neighbor acts as the router-of-record for the whole filtered
//! subgraph that only touches the requesting node through it, hence the
//! breadth-first walk that skips the requester and its other direct
//! neighbors. The resolver holds no state and takes no locks of its own, so
//! it is safe to call under read locks held by the store.


use crate::meshdb::{FeaturePort, MeshDb, MeshDbError, MeshGraph};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// A tunnel peer the requesting node must install.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: String,
    pub public_key: String,
    pub primary_endpoint: String,
    pub tunnel_endpoints: Vec<String>,
    pub zone_awareness_id: String,
    pub features: Vec<FeaturePort>,
    pub grpc_port: u16,
    /// Transport preference from the edge (`direct` or `ice`).
    pub proto: String,
    pub address_ipv4: Option<Ipv4Net>,
    pub address_ipv6: Option<Ipv6Net>,
    /// Prefixes routed to this peer, in insertion order, deduplicated.
    pub allowed_ips: Vec<IpNet>,
    /// External route prefixes within `allowed_ips`, tracked separately for
    /// firewall expression.
    pub allowed_routes: Vec<IpNet>,
}

impl PeerDescriptor {
    /// Whether this peering is negotiated over ICE.
    pub fn is_ice(&self) -> bool {
        self.proto == "ice"
    }
}

/// Insertion-ordered prefix set.
#[derive(Default)]
struct PrefixSet {
    items: Vec<IpNet>,
}

impl PrefixSet {
    fn insert(&mut self, prefix: IpNet) -> bool {
        if self.items.contains(&prefix) {
            return false;
        }
        self.items.push(prefix);
        true
    }

    fn contains(&self, prefix: &IpNet) -> bool {
        self.items.contains(prefix)
    }
}

/// Resolve the tunnel peers for `self_id`.
///
/// Returns an empty list when the node is unknown, has no public key, or is
/// isolated in the filtered graph. Output is sorted by peer id for
/// deterministic diffing.
pub fn resolve(db: &MeshDb, self_id: &str) -> Result<Vec<PeerDescriptor>, MeshDbError> {
    let peers = db.peers();
    let networking = db.networking();
    let graph = peers.graph()?;

    let Some(self_node) = graph.nodes.get(self_id) else {
        return Ok(Vec::new());
    };
    if self_node.public_key.is_empty() {
        return Ok(Vec::new());
    }

    let adjacency = networking.filter_graph(&graph)?;
    let self_routes: Vec<IpNet> = networking
        .routes_by_node(self_id)?
        .into_iter()
        .flat_map(|r| r.destination_cidrs)
        .collect();

    let empty = Default::default();
    let direct = adjacency.get(self_id).unwrap_or(&empty);
    let direct_ids: BTreeSet<&str> = direct.keys().map(String::as_str).collect();

    let mut out = Vec::with_capacity(direct.len());
    for (peer_id, edge) in direct {
        let Some(node) = graph.nodes.get(peer_id) else {
            continue;
        };
        if node.public_key.is_empty() {
            continue;
        }

        let mut allowed_ips = PrefixSet::default();
        let mut allowed_routes = PrefixSet::default();

        // The neighbor's own addresses and advertised routes.
        add_node_addrs(&graph, peer_id, &mut allowed_ips);
        add_node_routes(
            &networking,
            peer_id,
            &self_routes,
            &mut allowed_ips,
            &mut allowed_routes,
        )?;

        // Everything reachable only through this neighbor: BFS skipping the
        // requester and its other direct neighbors.
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        visited.insert(peer_id.as_str());
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(peer_id.as_str());
        while let Some(current) = queue.pop_front() {
            let Some(targets) = adjacency.get(current) else {
                continue;
            };
            for target in targets.keys() {
                let target = target.as_str();
                if target == self_id
                    || direct_ids.contains(target)
                    || !visited.insert(target)
                {
                    continue;
                }
                let Some(target_node) = graph.nodes.get(target) else {
                    continue;
                };
                if target_node.public_key.is_empty() {
                    continue;
                }
                add_node_addrs(&graph, target, &mut allowed_ips);
                add_node_routes(
                    &networking,
                    target,
                    &self_routes,
                    &mut allowed_ips,
                    &mut allowed_routes,
                )?;
                queue.push_back(target);
            }
        }

        let lease = graph.lease(peer_id);
        out.push(PeerDescriptor {
            id: node.id.clone(),
            public_key: node.public_key.clone(),
            primary_endpoint: node.primary_endpoint.clone(),
            tunnel_endpoints: node.tunnel_endpoints.clone(),
            zone_awareness_id: node.zone_awareness_id.clone(),
            features: node.features.clone(),
            grpc_port: node.grpc_port,
            proto: edge.proto().to_string(),
            address_ipv4: lease.and_then(|l| l.ipv4),
            address_ipv6: lease.and_then(|l| l.ipv6),
            allowed_ips: allowed_ips.items,
            allowed_routes: allowed_routes.items,
        });
    }

    out.sort_by(|x, y| x.id.cmp(&y.id));
    Ok(out)
}

fn add_node_addrs(graph: &MeshGraph, node_id: &str, allowed_ips: &mut PrefixSet) {
    if let Some(lease) = graph.lease(node_id) {
        if let Some(v4) = lease.ipv4 {
            allowed_ips.insert(IpNet::V4(v4));
        }
        if let Some(v6) = lease.ipv6 {
            allowed_ips.insert(IpNet::V6(v6));
        }
    }
}

fn add_node_routes(
    networking: &crate::meshdb::Networking<'_>,
    node_id: &str,
    self_routes: &[IpNet],
    allowed_ips: &mut PrefixSet,
    allowed_routes: &mut PrefixSet,
) -> Result<(), MeshDbError> {
    for route in networking.routes_by_node(node_id)? {
        for prefix in route.destination_cidrs {
            // The requester never routes its own advertised prefixes through
            // a peer.
            if self_routes.contains(&prefix) || allowed_ips.contains(&prefix) {
                continue;
            }
            allowed_ips.insert(prefix);
            allowed_routes.insert(prefix);
        }
    }
    Ok(())
}
