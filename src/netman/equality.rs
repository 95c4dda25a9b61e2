//! Peer Descriptor Equality
//!
//! Decides whether a peer needs re-programming. Identity is: id, public key,
//! primary endpoint, zone tag, private addresses, transport proto, and the
//! sorted allowed-ip, allowed-route, and feature lists. Order-insensitive on
//! the lists so storage iteration order never causes a spurious rewrite.

use crate::topology::PeerDescriptor;

/// Whether two descriptors program identically.
pub fn peers_equal(a: &PeerDescriptor, b: &PeerDescriptor) -> bool {
    a.id == b.id
        && a.public_key == b.public_key
        && a.primary_endpoint == b.primary_endpoint
        && a.zone_awareness_id == b.zone_awareness_id
        && a.proto == b.proto
        && a.address_ipv4 == b.address_ipv4
        && a.address_ipv6 == b.address_ipv6
        && sorted(&a.allowed_ips) == sorted(&b.allowed_ips)
        && sorted(&a.allowed_routes) == sorted(&b.allowed_routes)
        && sorted_features(a) == sorted_features(b)
}

fn sorted(prefixes: &[ipnet::IpNet]) -> Vec<String> {
    let mut out: Vec<String> = prefixes.iter().map(|p| p.to_string()).collect();
    out.sort();
    out
}

fn sorted_features(peer: &PeerDescriptor) -> Vec<(String, u16)> {
    let mut out: Vec<(String, u16)> = peer
        .features
        .iter()
        .map(|fp| (fp.feature.to_string(), fp.port))
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshdb::{Feature, FeaturePort};

    fn descriptor() -> PeerDescriptor {
        PeerDescriptor {
            id: "a".into(),
            public_key: "pk".into(),
            primary_endpoint: "1.2.3.4:51820".into(),
            proto: "direct".into(),
            allowed_ips: vec!["172.16.0.1/32".parse().unwrap(), "10.0.0.0/24".parse().unwrap()],
            features: vec![FeaturePort {
                feature: Feature::MeshDns,
                port: 53,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_equal_ignores_list_order() {
        let a = descriptor();
        let mut b = descriptor();
        b.allowed_ips.reverse();
        assert!(peers_equal(&a, &b));
    }

    #[test]
    fn test_field_changes_detected() {
        let a = descriptor();

        let mut changed = descriptor();
        changed.public_key = "other".into();
        assert!(!peers_equal(&a, &changed));

        let mut changed = descriptor();
        changed.allowed_ips.push("192.168.0.0/24".parse().unwrap());
        assert!(!peers_equal(&a, &changed));

        let mut changed = descriptor();
        changed.features[0].port = 5353;
        assert!(!peers_equal(&a, &changed));

        let mut changed = descriptor();
        changed.proto = "ice".into();
        assert!(!peers_equal(&a, &changed));
    }
}
