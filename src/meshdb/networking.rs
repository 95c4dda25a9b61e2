//! Routes and Network ACLs
//!
//! Routes advertise that a node reaches a set of external prefixes. ACLs are
//! priority-ordered accept/deny rules over source/destination nodes, CIDRs,
//! protocols, and ports; the first match wins and no match denies.
//!
//! Matching semantics: an empty constraint list matches everything. A list
//! entry is a literal, the wildcard `*`, a glob with exactly one `*`
//! (`p*`, `*s`, `p*s`), or a `group:<name>` reference. Group references are
//! expanded into a temporary resolved list at evaluation time; the stored
//! ACL stays declarative.

use super::rbac::SubjectKind;
use super::{keys, MeshDb, MeshDbError};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Reference prefix expanding to a group's node subjects.
pub const GROUP_REFERENCE: &str = "group:";

/// Advertisement that `node_id` reaches `destination_cidrs`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub node_id: String,
    pub destination_cidrs: Vec<IpNet>,
}

/// Verdict of an ACL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    Accept,
    Deny,
}

/// A network access-control rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub name: String,
    pub priority: i32,
    pub action: AclAction,
    #[serde(default)]
    pub source_nodes: Vec<String>,
    #[serde(default)]
    pub destination_nodes: Vec<String>,
    #[serde(default)]
    pub source_cidrs: Vec<String>,
    #[serde(default)]
    pub destination_cidrs: Vec<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Acl {
    /// An accept-everything rule at the given priority.
    pub fn accept_all(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            action: AclAction::Accept,
            source_nodes: vec!["*".into()],
            destination_nodes: vec!["*".into()],
            source_cidrs: vec!["*".into()],
            destination_cidrs: vec!["*".into()],
            protocols: vec!["*".into()],
            ports: Vec::new(),
        }
    }

    /// A deny-everything rule at the given priority.
    pub fn deny_all(name: impl Into<String>, priority: i32) -> Self {
        Self {
            action: AclAction::Deny,
            ..Self::accept_all(name, priority)
        }
    }
}

/// The action an ACL set is asked to judge.
#[derive(Clone, Debug, Default)]
pub struct NetworkAction {
    pub src_node: String,
    pub dst_node: String,
    pub src_cidr: String,
    pub dst_cidr: String,
    pub protocol: String,
    pub port: u16,
}

impl NetworkAction {
    /// The action the topology resolver evaluates for an edge `src -> dst`.
    pub fn edge(src: &str, dst: &str) -> Self {
        Self {
            src_node: src.to_string(),
            dst_node: dst.to_string(),
            src_cidr: "*".to_string(),
            dst_cidr: "*".to_string(),
            protocol: "*".to_string(),
            port: 0,
        }
    }
}

/// Directed adjacency after ACL filtering: `map[src]` holds every `dst`
/// whose edge traffic `src -> dst` is accepted.
pub type AdjacencyMap = BTreeMap<String, BTreeMap<String, super::peers::Edge>>;

/// Route and ACL view.
pub struct Networking<'a> {
    db: &'a MeshDb,
}

impl<'a> Networking<'a> {
    pub(super) fn new(db: &'a MeshDb) -> Self {
        Self { db }
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    /// Insert or replace a route. The owning node must exist.
    pub async fn put_route(&self, route: &Route) -> Result<(), MeshDbError> {
        if route.name.is_empty() {
            return Err(MeshDbError::InvalidArgument("route name is empty".into()));
        }
        if !self.db.peers().contains(&route.node_id)? {
            return Err(MeshDbError::not_found("node", route.node_id.clone()));
        }
        self.db
            .propose_put(keys::route_key(&route.name), route)
            .await?;
        Ok(())
    }

    /// Fetch a route by name.
    pub fn get_route(&self, name: &str) -> Result<Route, MeshDbError> {
        self.db
            .get_json(&keys::route_key(name))?
            .ok_or_else(|| MeshDbError::not_found("route", name))
    }

    /// Delete a route by name.
    pub async fn delete_route(&self, name: &str) -> Result<(), MeshDbError> {
        self.db.propose_delete(keys::route_key(name)).await?;
        Ok(())
    }

    /// All routes, ordered by name.
    pub fn routes(&self) -> Result<Vec<Route>, MeshDbError> {
        self.db.list_json(keys::ROUTES_PREFIX)
    }

    /// Every route owned by `node_id`.
    pub fn routes_by_node(&self, node_id: &str) -> Result<Vec<Route>, MeshDbError> {
        Ok(self
            .routes()?
            .into_iter()
            .filter(|r| r.node_id == node_id)
            .collect())
    }

    // ------------------------------------------------------------------
    // ACLs
    // ------------------------------------------------------------------

    /// Insert or replace an ACL.
    pub async fn put_acl(&self, acl: &Acl) -> Result<(), MeshDbError> {
        if acl.name.is_empty() {
            return Err(MeshDbError::InvalidArgument("acl name is empty".into()));
        }
        self.db.propose_put(keys::acl_key(&acl.name), acl).await?;
        Ok(())
    }

    /// Delete an ACL by name.
    pub async fn delete_acl(&self, name: &str) -> Result<(), MeshDbError> {
        self.db.propose_delete(keys::acl_key(name)).await?;
        Ok(())
    }

    /// All ACLs in evaluation order: priority descending, ties broken by
    /// name descending.
    pub fn acls(&self) -> Result<Vec<Acl>, MeshDbError> {
        let mut acls: Vec<Acl> = self.db.list_json(keys::ACLS_PREFIX)?;
        acls.sort_by(|x, y| {
            y.priority
                .cmp(&x.priority)
                .then_with(|| y.name.cmp(&x.name))
        });
        Ok(acls)
    }

    /// Evaluate `action` against the ACL set. First match wins; no match
    /// denies.
    pub fn accept(&self, action: &NetworkAction) -> Result<bool, MeshDbError> {
        let acls = self.acls()?;
        Ok(self.accept_sorted(&acls, action))
    }

    fn accept_sorted(&self, acls: &[Acl], action: &NetworkAction) -> bool {
        for acl in acls {
            if self.matches(acl, action) {
                return acl.action == AclAction::Accept;
            }
        }
        false
    }

    fn matches(&self, acl: &Acl, action: &NetworkAction) -> bool {
        if !action.src_node.is_empty() {
            let resolved = self.expand_groups(&acl.source_nodes);
            if !list_matches(&resolved, &action.src_node) {
                return false;
            }
        }
        if !action.dst_node.is_empty() {
            let resolved = self.expand_groups(&acl.destination_nodes);
            if !list_matches(&resolved, &action.dst_node) {
                return false;
            }
        }
        if !action.src_cidr.is_empty() && !list_matches(&acl.source_cidrs, &action.src_cidr) {
            return false;
        }
        if !action.dst_cidr.is_empty() && !list_matches(&acl.destination_cidrs, &action.dst_cidr) {
            return false;
        }
        if !action.protocol.is_empty() && !list_matches(&acl.protocols, &action.protocol) {
            return false;
        }
        if action.port != 0 && !acl.ports.is_empty() && !acl.ports.contains(&action.port) {
            return false;
        }
        true
    }

    /// Replace `group:<name>` references with the group's node subjects.
    /// The stored ACL is never mutated. Missing groups are skipped.
    fn expand_groups(&self, list: &[String]) -> Vec<String> {
        if !list.iter().any(|entry| entry.starts_with(GROUP_REFERENCE)) {
            return list.to_vec();
        }
        let mut out = Vec::with_capacity(list.len());
        for entry in list {
            let Some(group_name) = entry.strip_prefix(GROUP_REFERENCE) else {
                out.push(entry.clone());
                continue;
            };
            match self.db.rbac().get_group(group_name) {
                Ok(group) => {
                    for subject in &group.subjects {
                        match subject.kind {
                            SubjectKind::All => out.push("*".to_string()),
                            SubjectKind::Node => out.push(subject.name.clone()),
                            SubjectKind::User => {}
                        }
                    }
                }
                Err(MeshDbError::NotFound { .. }) => {}
                Err(e) => {
                    warn!(group = group_name, error = %e, "failed to expand group reference");
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Graph filtering
    // ------------------------------------------------------------------

    /// ACL-filter the membership graph into a directed adjacency map:
    /// `dst` is adjacent to `src` iff traffic `src -> dst` is accepted.
    pub fn filter_graph(
        &self,
        graph: &super::peers::MeshGraph,
    ) -> Result<AdjacencyMap, MeshDbError> {
        let acls = self.acls()?;
        let mut filtered: AdjacencyMap = BTreeMap::new();
        for id in graph.nodes.keys() {
            filtered.entry(id.clone()).or_default();
        }
        for (src, neighbors) in &graph.adjacency {
            for (dst, edge) in neighbors {
                let action = NetworkAction::edge(src, dst);
                if self.accept_sorted(&acls, &action) {
                    filtered
                        .entry(src.clone())
                        .or_default()
                        .insert(dst.clone(), edge.clone());
                }
            }
        }
        Ok(filtered)
    }
}

/// Match `value` against a constraint list. Empty list matches everything;
/// `*` matches anything; one-`*` globs match by prefix/suffix/both.
fn list_matches(list: &[String], value: &str) -> bool {
    if list.is_empty() {
        return true;
    }
    list.iter().any(|pattern| pattern_matches(pattern, value))
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.split_once('*') {
        None => pattern == value,
        Some((prefix, suffix)) => {
            value.len() >= prefix.len() + suffix.len()
                && value.starts_with(prefix)
                && value.ends_with(suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshdb::rbac::{Group, Subject};
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

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("node-1", "node-1"));
        assert!(!pattern_matches("node-1", "node-2"));
        assert!(pattern_matches("site1-*", "site1-router"));
        assert!(!pattern_matches("site1-*", "site2-router"));
        assert!(pattern_matches("*-router", "site1-router"));
        assert!(pattern_matches("site*router", "site1-router"));
        assert!(!pattern_matches("site*router", "site1-follower"));
    }

    #[test]
    fn test_empty_list_matches_everything() {
        assert!(list_matches(&[], "anything"));
    }

    #[tokio::test]
    async fn test_routes_by_node() {
        let db = db();
        put_node(&db, "a").await;
        put_node(&db, "b").await;
        let nw = db.networking();
        nw.put_route(&Route {
            name: "a-lan".into(),
            node_id: "a".into(),
            destination_cidrs: vec!["10.0.0.0/24".parse().unwrap()],
        })
        .await
        .unwrap();
        nw.put_route(&Route {
            name: "b-lan".into(),
            node_id: "b".into(),
            destination_cidrs: vec!["10.0.1.0/24".parse().unwrap()],
        })
        .await
        .unwrap();
        assert_eq!(nw.routes_by_node("a").unwrap().len(), 1);
        assert!(matches!(
            nw.put_route(&Route {
                name: "ghost".into(),
                node_id: "ghost".into(),
                destination_cidrs: vec![],
            })
            .await,
            Err(MeshDbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_priority_order_first_match_wins() {
        let db = db();
        let nw = db.networking();
        nw.put_acl(&Acl::accept_all("allow-all", 0)).await.unwrap();
        let mut deny = Acl::deny_all("deny-a-to-b", 100);
        deny.source_nodes = vec!["a".into()];
        deny.destination_nodes = vec!["b".into()];
        nw.put_acl(&deny).await.unwrap();

        assert!(!nw.accept(&NetworkAction::edge("a", "b")).unwrap());
        assert!(nw.accept(&NetworkAction::edge("b", "a")).unwrap());
        assert!(nw.accept(&NetworkAction::edge("a", "c")).unwrap());
    }

    #[tokio::test]
    async fn test_no_match_denies() {
        let db = db();
        let nw = db.networking();
        let mut narrow = Acl::accept_all("narrow", 0);
        narrow.source_nodes = vec!["x".into()];
        nw.put_acl(&narrow).await.unwrap();
        assert!(!nw.accept(&NetworkAction::edge("a", "b")).unwrap());
    }

    #[tokio::test]
    async fn test_tie_broken_by_name_descending() {
        let db = db();
        let nw = db.networking();
        // Same priority: "zz-deny" sorts before "aa-allow".
        nw.put_acl(&Acl::deny_all("zz-deny", 50)).await.unwrap();
        nw.put_acl(&Acl::accept_all("aa-allow", 50)).await.unwrap();
        assert!(!nw.accept(&NetworkAction::edge("a", "b")).unwrap());
    }

    #[tokio::test]
    async fn test_group_expansion_does_not_mutate_acl() {
        let db = db();
        let nw = db.networking();
        db.rbac()
            .put_group(&Group {
                name: "routers".into(),
                subjects: vec![Subject {
                    kind: SubjectKind::Node,
                    name: "r1".into(),
                }],
            })
            .await
            .unwrap();
        let mut acl = Acl::accept_all("group-rule", 10);
        acl.source_nodes = vec![format!("{GROUP_REFERENCE}routers")];
        nw.put_acl(&acl).await.unwrap();

        assert!(nw.accept(&NetworkAction::edge("r1", "x")).unwrap());
        assert!(!nw.accept(&NetworkAction::edge("r2", "x")).unwrap());
        // The stored rule still carries the reference, not the expansion.
        let stored: Acl = db
            .get_json(&keys::acl_key("group-rule"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.source_nodes, vec![format!("{GROUP_REFERENCE}routers")]);
    }

    #[tokio::test]
    async fn test_missing_group_is_skipped() {
        let db = db();
        let nw = db.networking();
        let mut acl = Acl::accept_all("dangling", 10);
        acl.source_nodes = vec![format!("{GROUP_REFERENCE}ghosts"), "a".into()];
        nw.put_acl(&acl).await.unwrap();
        assert!(nw.accept(&NetworkAction::edge("a", "b")).unwrap());
        assert!(!nw.accept(&NetworkAction::edge("ghost", "b")).unwrap());
    }

    #[tokio::test]
    async fn test_filter_graph_is_directional() {
        let db = db();
        for id in ["a", "b"] {
            put_node(&db, id).await;
        }
        db.peers()
            .put_edge(&super::super::peers::Edge {
                a: "a".into(),
                b: "b".into(),
                weight: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        let nw = db.networking();
        nw.put_acl(&Acl::accept_all("allow-all", 0)).await.unwrap();
        let mut deny = Acl::deny_all("deny-a-b", 100);
        deny.source_nodes = vec!["a".into()];
        deny.destination_nodes = vec!["b".into()];
        nw.put_acl(&deny).await.unwrap();

        let graph = db.peers().graph().unwrap();
        let filtered = nw.filter_graph(&graph).unwrap();
        assert!(!filtered["a"].contains_key("b"));
        assert!(filtered["b"].contains_key("a"));
    }
}
