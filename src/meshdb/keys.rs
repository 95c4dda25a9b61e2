//! Registry key layout for mesh state.
//!
//! Every typed table lives under its own prefix. Snapshots group records by
//! these prefixes, so renaming one is a schema migration.

/// Root of every mesh-state table; subscribing here observes all of them.
pub const REGISTRY_PREFIX: &str = "/registry/";

/// Singleton mesh state (supernets + domain).
pub const MESH_STATE: &str = "/registry/meshstate";

/// Node records, keyed by node id.
pub const NODES_PREFIX: &str = "/registry/nodes/";

/// Edge records, keyed by the normalized pair `a:b` (lexicographic).
pub const EDGES_PREFIX: &str = "/registry/edges/";

/// Address leases, keyed by node id.
pub const LEASES_PREFIX: &str = "/registry/leases/";

/// ASN assignments, keyed by node id.
pub const ASNS_PREFIX: &str = "/registry/asns/";

/// Route advertisements, keyed by route name.
pub const ROUTES_PREFIX: &str = "/registry/routes/";

/// Groups, keyed by group name.
pub const GROUPS_PREFIX: &str = "/registry/groups/";

/// Network ACLs, keyed by ACL name.
pub const ACLS_PREFIX: &str = "/registry/acls/";

/// Role bindings, keyed by binding name.
pub const ROLE_BINDINGS_PREFIX: &str = "/registry/rolebindings/";

/// Key for a node record.
pub fn node_key(id: &str) -> String {
    format!("{NODES_PREFIX}{id}")
}

/// Key for an edge record. The pair is normalized so `{a,b}` and `{b,a}`
/// land on the same key.
pub fn edge_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{EDGES_PREFIX}{lo}:{hi}")
}

/// Key for a node's lease record.
pub fn lease_key(node_id: &str) -> String {
    format!("{LEASES_PREFIX}{node_id}")
}

/// Key for a node's ASN assignment.
pub fn asn_key(node_id: &str) -> String {
    format!("{ASNS_PREFIX}{node_id}")
}

/// Key for a route record.
pub fn route_key(name: &str) -> String {
    format!("{ROUTES_PREFIX}{name}")
}

/// Key for a group record.
pub fn group_key(name: &str) -> String {
    format!("{GROUPS_PREFIX}{name}")
}

/// Key for an ACL record.
pub fn acl_key(name: &str) -> String {
    format!("{ACLS_PREFIX}{name}")
}

/// Key for a role binding record.
pub fn role_binding_key(name: &str) -> String {
    format!("{ROLE_BINDINGS_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_key_normalized() {
        assert_eq!(edge_key("b", "a"), edge_key("a", "b"));
        assert_eq!(edge_key("a", "b"), "/registry/edges/a:b");
    }
}
