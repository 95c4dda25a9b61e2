//! Address, ASN, and Mesh-State Allocation
//!
//! Hands out the lowest-ordered free address in a subnet, the lowest unused
//! ASN in the private range, and the one-time mesh state at bootstrap. Every
//! write is routed through the replicated log, so allocation is linearized
//! across the cluster; allocation is idempotent per node (an existing live
//! lease is returned unchanged).

use crate::meshdb::{
    Acl, AclAction, Lease, MeshDb, MeshDbError, MeshState, RbacRole, RoleBinding, Subject,
};
use ipnet::{Ipv4Net, Ipv6Net};
use rand::RngCore;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::{debug, info};

/// Default private ASN range (RFC 6996 32-bit block).
pub const DEFAULT_ASN_RANGE: std::ops::RangeInclusive<u32> = 4_200_000_000..=4_294_967_294;

/// Name of the ACL installed by `default-network-policy`.
pub const DEFAULT_POLICY_ACL: &str = "default-network-policy";

/// Name of the admin role binding installed at bootstrap.
pub const ADMIN_ROLE_BINDING: &str = "mesh-admin";

/// Errors from the allocator.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("subnet {0} is exhausted")]
    Exhausted(String),

    #[error("ASN range is exhausted")]
    AsnExhausted,

    #[error("mesh is not bootstrapped")]
    NotBootstrapped,

    #[error(transparent)]
    MeshDb(#[from] MeshDbError),
}

/// Parameters for mesh bootstrap.
#[derive(Clone, Debug)]
pub struct BootstrapOptions {
    pub ipv4_network: Ipv4Net,
    /// Generated RFC 4193 ULA /48 when unset.
    pub ipv6_network: Option<Ipv6Net>,
    pub domain: String,
    pub default_policy: AclAction,
    pub admin_node_id: Option<String>,
    pub disable_rbac: bool,
    pub force: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            ipv4_network: "172.16.0.0/12".parse().unwrap(),
            ipv6_network: None,
            domain: "weft.internal.".to_string(),
            default_policy: AclAction::Accept,
            admin_node_id: None,
            disable_rbac: false,
            force: false,
        }
    }
}

/// The built-in IPAM and identity allocator.
#[derive(Clone)]
pub struct Allocator {
    db: MeshDb,
}

impl Allocator {
    pub fn new(db: MeshDb) -> Self {
        Self { db }
    }

    /// Allocate the lowest free /32 in `subnet` for `node_id`. Idempotent:
    /// an existing v4 lease is returned unchanged.
    pub async fn allocate_ipv4(
        &self,
        node_id: &str,
        subnet: Ipv4Net,
    ) -> Result<Ipv4Net, AllocatorError> {
        let peers = self.db.peers();
        let existing = peers.lease(node_id)?;
        if let Some(prefix) = existing.as_ref().and_then(|l| l.ipv4) {
            return Ok(prefix);
        }

        let used: BTreeSet<Ipv4Addr> = peers
            .leases()?
            .iter()
            .filter_map(|l| l.ipv4)
            .map(|p| p.addr())
            .collect();
        let addr = subnet
            .hosts()
            .find(|addr| !used.contains(addr))
            .ok_or_else(|| AllocatorError::Exhausted(subnet.to_string()))?;
        let prefix = Ipv4Net::new(addr, 32).expect("/32 of a host address");

        let lease = Lease {
            node_id: node_id.to_string(),
            ipv4: Some(prefix),
            ipv6: existing.and_then(|l| l.ipv6),
            expires_at: 0,
        };
        peers.put_lease(&lease).await?;
        debug!(node = node_id, prefix = %prefix, "allocated IPv4 lease");
        Ok(prefix)
    }

    /// Allocate the lowest free /128 in `subnet` for `node_id`. Idempotent
    /// like the v4 path. The subnet-router anycast address is skipped.
    pub async fn allocate_ipv6(
        &self,
        node_id: &str,
        subnet: Ipv6Net,
    ) -> Result<Ipv6Net, AllocatorError> {
        let peers = self.db.peers();
        let existing = peers.lease(node_id)?;
        if let Some(prefix) = existing.as_ref().and_then(|l| l.ipv6) {
            return Ok(prefix);
        }

        let used: BTreeSet<Ipv6Addr> = peers
            .leases()?
            .iter()
            .filter_map(|l| l.ipv6)
            .map(|p| p.addr())
            .collect();
        let anycast = subnet.network();
        let addr = subnet
            .hosts()
            .filter(|addr| *addr != anycast)
            .find(|addr| !used.contains(addr))
            .ok_or_else(|| AllocatorError::Exhausted(subnet.to_string()))?;
        let prefix = Ipv6Net::new(addr, 128).expect("/128 of a host address");

        let lease = Lease {
            node_id: node_id.to_string(),
            ipv4: existing.and_then(|l| l.ipv4),
            ipv6: Some(prefix),
            expires_at: 0,
        };
        peers.put_lease(&lease).await?;
        debug!(node = node_id, prefix = %prefix, "allocated IPv6 lease");
        Ok(prefix)
    }

    /// Release both of a node's leases.
    pub async fn release(&self, node_id: &str) -> Result<(), AllocatorError> {
        self.db.peers().release_lease(node_id).await?;
        Ok(())
    }

    /// Assign the lowest unused ASN in `range` to `node_id`. Idempotent per
    /// node.
    pub async fn allocate_asn(
        &self,
        node_id: &str,
        range: std::ops::RangeInclusive<u32>,
    ) -> Result<u32, AllocatorError> {
        let key = crate::meshdb::keys::asn_key(node_id);
        if let Some(existing) = self.db.get_json::<u32>(&key)? {
            return Ok(existing);
        }
        let mut used = BTreeSet::new();
        self.db
            .store()
            .iter_prefix(crate::meshdb::keys::ASNS_PREFIX, &mut |_, value| {
                if let Ok(asn) = value.parse::<u32>() {
                    used.insert(asn);
                }
                true
            })
            .map_err(MeshDbError::from)?;
        let asn = range
            .clone()
            .find(|candidate| !used.contains(candidate))
            .ok_or(AllocatorError::AsnExhausted)?;
        self.db.propose_put(key, &asn).await?;
        debug!(node = node_id, asn, "assigned ASN");
        Ok(asn)
    }

    /// Write the one-time mesh state plus the default network policy and,
    /// unless RBAC is disabled, the admin role binding. A no-op when already
    /// bootstrapped and `force` is unset.
    pub async fn bootstrap(&self, opts: BootstrapOptions) -> Result<MeshState, AllocatorError> {
        let view = self.db.mesh_state();
        if let Some(existing) = view.get()? {
            if !opts.force {
                debug!("mesh already bootstrapped");
                return Ok(existing);
            }
        }
        let ipv6_network = match opts.ipv6_network {
            Some(net) => net,
            None => generate_ula(),
        };
        let state = MeshState {
            ipv4_network: opts.ipv4_network,
            ipv6_network,
            domain: opts.domain.clone(),
        };
        view.set(state.clone(), opts.force).await?;

        let policy = match opts.default_policy {
            AclAction::Accept => Acl::accept_all(DEFAULT_POLICY_ACL, i32::MIN),
            AclAction::Deny => Acl::deny_all(DEFAULT_POLICY_ACL, i32::MIN),
        };
        self.db.networking().put_acl(&policy).await?;

        if !opts.disable_rbac {
            if let Some(admin) = &opts.admin_node_id {
                self.db
                    .rbac()
                    .put_role_binding(&RoleBinding {
                        name: ADMIN_ROLE_BINDING.to_string(),
                        role: RbacRole::Admin,
                        subjects: vec![Subject::node(admin.clone())],
                    })
                    .await?;
            }
        }
        info!(
            ipv4 = %state.ipv4_network,
            ipv6 = %state.ipv6_network,
            domain = %state.domain,
            "mesh bootstrapped"
        );
        Ok(state)
    }
}

/// Generate an RFC 4193 unique-local /48: `fd` followed by 40 random bits.
pub fn generate_ula() -> Ipv6Net {
    let mut global_id = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut global_id);
    let segments = [
        0xfd00 | global_id[0] as u16,
        ((global_id[1] as u16) << 8) | global_id[2] as u16,
        ((global_id[3] as u16) << 8) | global_id[4] as u16,
        0,
        0,
        0,
        0,
        0,
    ];
    let addr = Ipv6Addr::from(segments);
    Ipv6Net::new(addr, 48).expect("/48 of a ULA address")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshdb::MeshNode;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    fn db() -> MeshDb {
        MeshDb::local(Arc::new(MemoryStore::new()))
    }

    async fn put_node(db: &MeshDb, id: &str) {
        db.peers()
            .put(&MeshNode {
                id: id.to_string(),
                public_key: format!("key-{id}"),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_allocate_lowest_free() {
        let db = db();
        let alloc = Allocator::new(db.clone());
        let subnet: Ipv4Net = "172.16.0.0/29".parse().unwrap();
        put_node(&db, "a").await;
        put_node(&db, "b").await;
        let a = alloc.allocate_ipv4("a", subnet).await.unwrap();
        let b = alloc.allocate_ipv4("b", subnet).await.unwrap();
        assert_eq!(a.to_string(), "172.16.0.1/32");
        assert_eq!(b.to_string(), "172.16.0.2/32");
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent() {
        let db = db();
        let alloc = Allocator::new(db.clone());
        let subnet: Ipv4Net = "172.16.0.0/29".parse().unwrap();
        put_node(&db, "a").await;
        let first = alloc.allocate_ipv4("a", subnet).await.unwrap();
        let second = alloc.allocate_ipv4("a", subnet).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.peers().leases().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let db = db();
        let alloc = Allocator::new(db.clone());
        // A /30 has two usable hosts.
        let subnet: Ipv4Net = "172.16.0.0/30".parse().unwrap();
        for id in ["a", "b", "c"] {
            put_node(&db, id).await;
        }
        alloc.allocate_ipv4("a", subnet).await.unwrap();
        alloc.allocate_ipv4("b", subnet).await.unwrap();
        let err = alloc.allocate_ipv4("c", subnet).await.unwrap_err();
        assert!(matches!(err, AllocatorError::Exhausted(_)));
    }

    #[tokio::test]
    async fn test_release_allows_reuse() {
        let db = db();
        let alloc = Allocator::new(db.clone());
        let subnet: Ipv4Net = "172.16.0.0/30".parse().unwrap();
        for id in ["a", "b", "c"] {
            put_node(&db, id).await;
        }
        alloc.allocate_ipv4("a", subnet).await.unwrap();
        alloc.allocate_ipv4("b", subnet).await.unwrap();
        alloc.release("a").await.unwrap();
        let reused = alloc.allocate_ipv4("c", subnet).await.unwrap();
        assert_eq!(reused.to_string(), "172.16.0.1/32");
    }

    #[tokio::test]
    async fn test_allocate_ipv6_skips_anycast() {
        let db = db();
        let alloc = Allocator::new(db.clone());
        let subnet: Ipv6Net = "fd00:1:2::/48".parse().unwrap();
        put_node(&db, "a").await;
        let prefix = alloc.allocate_ipv6("a", subnet).await.unwrap();
        assert_eq!(prefix.to_string(), "fd00:1:2::1/128");
    }

    #[tokio::test]
    async fn test_both_families_share_one_lease() {
        let db = db();
        let alloc = Allocator::new(db.clone());
        put_node(&db, "a").await;
        alloc
            .allocate_ipv4("a", "172.16.0.0/29".parse().unwrap())
            .await
            .unwrap();
        alloc
            .allocate_ipv6("a", "fd00:1:2::/48".parse().unwrap())
            .await
            .unwrap();
        let lease = db.peers().lease("a").unwrap().unwrap();
        assert!(lease.ipv4.is_some());
        assert!(lease.ipv6.is_some());
        assert_eq!(db.peers().leases().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_asn_assignment() {
        let db = db();
        let alloc = Allocator::new(db.clone());
        let first = alloc.allocate_asn("a", 64512..=64515).await.unwrap();
        let again = alloc.allocate_asn("a", 64512..=64515).await.unwrap();
        let second = alloc.allocate_asn("b", 64512..=64515).await.unwrap();
        assert_eq!(first, 64512);
        assert_eq!(again, 64512);
        assert_eq!(second, 64513);
        let err = async {
            alloc.allocate_asn("c", 64512..=64513).await?;
            alloc.allocate_asn("d", 64512..=64513).await
        }
        .await
        .unwrap_err();
        assert!(matches!(err, AllocatorError::AsnExhausted));
    }

    #[test]
    fn test_generate_ula_shape() {
        for _ in 0..16 {
            let ula = generate_ula();
            assert_eq!(ula.prefix_len(), 48);
            assert_eq!(ula.addr().octets()[0], 0xfd);
        }
    }

    #[tokio::test]
    async fn test_bootstrap_installs_policy_and_admin() {
        let db = db();
        let alloc = Allocator::new(db.clone());
        let state = alloc
            .bootstrap(BootstrapOptions {
                admin_node_id: Some("admin".into()),
                default_policy: AclAction::Deny,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(state.ipv6_network.prefix_len(), 48);
        let acls = db.networking().acls().unwrap();
        assert_eq!(acls.len(), 1);
        assert_eq!(acls[0].action, AclAction::Deny);
        assert!(db
            .rbac()
            .can("admin", crate::meshdb::rbac::Right::Admin)
            .unwrap());

        // Second bootstrap without force is a no-op returning current state.
        let again = alloc.bootstrap(BootstrapOptions::default()).await.unwrap();
        assert_eq!(again, state);
    }
}
