//! Nodes, Edges, and Leases
//!
//! The membership graph: node records keyed by id, undirected edges stored
//! once under a normalized pair key, and per-node address leases. Deleting a
//! node cascades through its lease, ASN, edges, and owned routes in a single
//! replicated batch.

use super::{keys, MeshDb, MeshDbError};
use crate::raft::Command;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Optional services a node can advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    /// Node serves mesh DNS.
    MeshDns,
    /// Node can broker ICE negotiation for NATed peers.
    IceNegotiation,
    /// Node runs a TURN relay.
    TurnRelay,
    /// Node offers bulk storage to the mesh.
    Storage,
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feature::MeshDns => write!(f, "mesh-dns"),
            Feature::IceNegotiation => write!(f, "ice-negotiation"),
            Feature::TurnRelay => write!(f, "turn-relay"),
            Feature::Storage => write!(f, "storage"),
        }
    }
}

/// A feature advertisement with its service port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeaturePort {
    pub feature: Feature,
    pub port: u16,
}

/// A member of the mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNode {
    /// Globally unique id.
    pub id: String,
    /// Tunnel public key, base64. Empty until the node first configures its
    /// tunnel; nodes without a key never appear in topology output.
    #[serde(default)]
    pub public_key: String,
    /// Publicly reachable `host:port`, empty for NAT-bound nodes.
    #[serde(default)]
    pub primary_endpoint: String,
    /// Additional tunnel endpoints, in preference order.
    #[serde(default)]
    pub tunnel_endpoints: Vec<String>,
    /// Zone-awareness tag; nodes sharing a tag prefer LAN endpoints.
    #[serde(default)]
    pub zone_awareness_id: String,
    /// Advertised optional services.
    #[serde(default)]
    pub features: Vec<FeaturePort>,
    /// Advertised control (gRPC) port.
    #[serde(default)]
    pub grpc_port: u16,
    /// Raft listen address for configuration changes.
    #[serde(default)]
    pub raft_addr: String,
    /// Unix seconds at first join.
    #[serde(default)]
    pub joined_at: u64,
}

impl MeshNode {
    /// Whether the node advertises `feature`.
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.iter().any(|fp| fp.feature == feature)
    }

    /// The advertised port for `feature`, if any.
    pub fn feature_port(&self, feature: Feature) -> Option<u16> {
        self.features
            .iter()
            .find(|fp| fp.feature == feature)
            .map(|fp| fp.port)
    }
}

/// Edge attribute naming the preferred transport (`direct` or `ice`).
pub const EDGE_ATTR_PROTO: &str = "proto";

/// Declared adjacency between two nodes. Stored once per unordered pair;
/// adjacency is materialized symmetrically at read time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub a: String,
    pub b: String,
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl Edge {
    /// The preferred transport recorded on the edge, defaulting to direct.
    pub fn proto(&self) -> &str {
        self.attrs
            .get(EDGE_ATTR_PROTO)
            .map(String::as_str)
            .unwrap_or("direct")
    }

    /// The far end of the edge as seen from `from`.
    pub fn other(&self, from: &str) -> &str {
        if self.a == from {
            &self.b
        } else {
            &self.a
        }
    }
}

/// Address lease for a node. At most one live prefix per family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub node_id: String,
    #[serde(default)]
    pub ipv4: Option<Ipv4Net>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Net>,
    /// Unix seconds; 0 = no expiry (membership lifetime).
    #[serde(default)]
    pub expires_at: u64,
}

/// The membership graph materialized for one resolution pass.
#[derive(Clone, Debug, Default)]
pub struct MeshGraph {
    pub nodes: BTreeMap<String, MeshNode>,
    pub leases: BTreeMap<String, Lease>,
    /// Symmetric adjacency: `adjacency[a][b]` and `adjacency[b][a]` hold the
    /// same stored edge.
    pub adjacency: BTreeMap<String, BTreeMap<String, Edge>>,
}

impl MeshGraph {
    /// The lease of `node_id`, if any.
    pub fn lease(&self, node_id: &str) -> Option<&Lease> {
        self.leases.get(node_id)
    }
}

/// Node/edge/lease view.
pub struct Peers<'a> {
    db: &'a MeshDb,
}

impl<'a> Peers<'a> {
    pub(super) fn new(db: &'a MeshDb) -> Self {
        Self { db }
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    /// Create or replace a node record.
    pub async fn put(&self, node: &MeshNode) -> Result<(), MeshDbError> {
        if node.id.is_empty() {
            return Err(MeshDbError::InvalidArgument("node id is empty".into()));
        }
        self.db
            .propose_put(keys::node_key(&node.id), node)
            .await?;
        Ok(())
    }

    /// Fetch a node by id.
    pub fn get(&self, id: &str) -> Result<MeshNode, MeshDbError> {
        self.db
            .get_json(&keys::node_key(id))?
            .ok_or_else(|| MeshDbError::not_found("node", id))
    }

    /// Whether a node exists.
    pub fn contains(&self, id: &str) -> Result<bool, MeshDbError> {
        Ok(self.db.store().get(&keys::node_key(id))?.is_some())
    }

    /// All nodes, ordered by id.
    pub fn list(&self) -> Result<Vec<MeshNode>, MeshDbError> {
        self.db.list_json(keys::NODES_PREFIX)
    }

    /// All nodes advertising `feature`.
    pub fn list_by_feature(&self, feature: Feature) -> Result<Vec<MeshNode>, MeshDbError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|n| n.has_feature(feature))
            .collect())
    }

    /// Delete a node and everything hanging off it: lease, ASN, edges, and
    /// owned routes, in one replicated batch.
    pub async fn delete(&self, id: &str) -> Result<(), MeshDbError> {
        let mut commands = vec![
            Command::delete(keys::node_key(id)),
            Command::delete(keys::lease_key(id)),
            Command::delete(keys::asn_key(id)),
        ];
        for edge in self.edges()? {
            if edge.a == id || edge.b == id {
                commands.push(Command::delete(keys::edge_key(&edge.a, &edge.b)));
            }
        }
        for route in self.db.networking().routes_by_node(id)? {
            commands.push(Command::delete(keys::route_key(&route.name)));
        }
        self.db.propose(Command::Batch { commands }).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------

    /// Insert or replace an edge. Both endpoints must exist.
    pub async fn put_edge(&self, edge: &Edge) -> Result<(), MeshDbError> {
        if edge.a == edge.b {
            return Err(MeshDbError::InvalidArgument(format!(
                "self-edge on {:?}",
                edge.a
            )));
        }
        for end in [&edge.a, &edge.b] {
            if !self.contains(end)? {
                return Err(MeshDbError::not_found("node", end.clone()));
            }
        }
        self.db
            .propose_put(keys::edge_key(&edge.a, &edge.b), edge)
            .await?;
        Ok(())
    }

    /// Remove the edge between `a` and `b`, if present.
    pub async fn remove_edge(&self, a: &str, b: &str) -> Result<(), MeshDbError> {
        self.db.propose_delete(keys::edge_key(a, b)).await?;
        Ok(())
    }

    /// All stored edges.
    pub fn edges(&self) -> Result<Vec<Edge>, MeshDbError> {
        self.db.list_json(keys::EDGES_PREFIX)
    }

    // ------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------

    /// Write a node's lease record.
    pub async fn put_lease(&self, lease: &Lease) -> Result<(), MeshDbError> {
        if !self.contains(&lease.node_id)? {
            return Err(MeshDbError::not_found("node", lease.node_id.clone()));
        }
        self.db
            .propose_put(keys::lease_key(&lease.node_id), lease)
            .await?;
        Ok(())
    }

    /// A node's lease, if any.
    pub fn lease(&self, node_id: &str) -> Result<Option<Lease>, MeshDbError> {
        self.db.get_json(&keys::lease_key(node_id))
    }

    /// All live leases.
    pub fn leases(&self) -> Result<Vec<Lease>, MeshDbError> {
        self.db.list_json(keys::LEASES_PREFIX)
    }

    /// Delete a node's lease. The release is a separate log entry, so it is
    /// observable before any re-issue.
    pub async fn release_lease(&self, node_id: &str) -> Result<(), MeshDbError> {
        self.db.propose_delete(keys::lease_key(node_id)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Graph
    // ------------------------------------------------------------------

    /// Materialize the full membership graph. Edges referencing a missing
    /// node are a referential-integrity failure, not silently dropped.
    pub fn graph(&self) -> Result<MeshGraph, MeshDbError> {
        let mut graph = MeshGraph::default();
        for node in self.list()? {
            graph.adjacency.entry(node.id.clone()).or_default();
            graph.nodes.insert(node.id.clone(), node);
        }
        for lease in self.leases()? {
            graph.leases.insert(lease.node_id.clone(), lease);
        }
        for edge in self.edges()? {
            for end in [&edge.a, &edge.b] {
                if !graph.nodes.contains_key(end) {
                    return Err(MeshDbError::not_found("node", end.clone()));
                }
            }
            graph
                .adjacency
                .entry(edge.a.clone())
                .or_default()
                .insert(edge.b.clone(), edge.clone());
            graph
                .adjacency
                .entry(edge.b.clone())
                .or_default()
                .insert(edge.a.clone(), edge);
        }
        Ok(graph)
    }

    /// Direct neighbors of `id` in the unfiltered graph.
    pub fn neighbors(&self, id: &str) -> Result<BTreeSet<String>, MeshDbError> {
        let mut out = BTreeSet::new();
        for edge in self.edges()? {
            if edge.a == id {
                out.insert(edge.b);
            } else if edge.b == id {
                out.insert(edge.a);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshdb::networking::Route;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    fn db() -> MeshDb {
        MeshDb::local(Arc::new(MemoryStore::new()))
    }

    fn node(id: &str) -> MeshNode {
        MeshNode {
            id: id.to_string(),
            public_key: format!("key-{id}"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_put_get_list() {
        let db = db();
        let peers = db.peers();
        peers.put(&node("b")).await.unwrap();
        peers.put(&node("a")).await.unwrap();
        assert_eq!(peers.get("a").unwrap().public_key, "key-a");
        let ids: Vec<String> = peers.list().unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(matches!(
            peers.get("missing"),
            Err(MeshDbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_edge_requires_endpoints() {
        let db = db();
        let peers = db.peers();
        peers.put(&node("a")).await.unwrap();
        let edge = Edge {
            a: "a".into(),
            b: "ghost".into(),
            weight: 1,
            ..Default::default()
        };
        assert!(matches!(
            peers.put_edge(&edge).await,
            Err(MeshDbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_graph_is_symmetric() {
        let db = db();
        let peers = db.peers();
        peers.put(&node("a")).await.unwrap();
        peers.put(&node("b")).await.unwrap();
        peers
            .put_edge(&Edge {
                a: "b".into(),
                b: "a".into(),
                weight: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        let graph = peers.graph().unwrap();
        assert!(graph.adjacency["a"].contains_key("b"));
        assert!(graph.adjacency["b"].contains_key("a"));
        // Stored once regardless of insertion direction.
        assert_eq!(peers.edges().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let db = db();
        let peers = db.peers();
        peers.put(&node("a")).await.unwrap();
        peers.put(&node("b")).await.unwrap();
        peers
            .put_edge(&Edge {
                a: "a".into(),
                b: "b".into(),
                weight: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        peers
            .put_lease(&Lease {
                node_id: "a".into(),
                ipv4: Some("172.16.0.1/32".parse().unwrap()),
                ipv6: None,
                expires_at: 0,
            })
            .await
            .unwrap();
        db.networking()
            .put_route(&Route {
                name: "a-lan".into(),
                node_id: "a".into(),
                destination_cidrs: vec!["10.0.0.0/24".parse().unwrap()],
            })
            .await
            .unwrap();

        peers.delete("a").await.unwrap();
        assert!(!peers.contains("a").unwrap());
        assert!(peers.lease("a").unwrap().is_none());
        assert!(peers.edges().unwrap().is_empty());
        assert!(db.networking().routes_by_node("a").unwrap().is_empty());
        assert!(peers.contains("b").unwrap());
    }

    #[tokio::test]
    async fn test_list_by_feature() {
        let db = db();
        let peers = db.peers();
        let mut dns = node("dns");
        dns.features.push(FeaturePort {
            feature: Feature::MeshDns,
            port: 53,
        });
        peers.put(&dns).await.unwrap();
        peers.put(&node("plain")).await.unwrap();
        let found = peers.list_by_feature(Feature::MeshDns).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "dns");
        assert_eq!(found[0].feature_port(Feature::MeshDns), Some(53));
    }
}
