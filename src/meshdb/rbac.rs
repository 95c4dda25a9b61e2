//! Groups and Role Bindings
//!
//! Minimal RBAC: groups collect subjects for ACL references and role
//! bindings grant rights checked by the membership service (route
//! advertisement, data-channel negotiation, administration). The whole layer
//! can be disabled at bootstrap, in which case every check passes.

use super::{keys, MeshDb, MeshDbError};
use serde::{Deserialize, Serialize};

/// What a subject names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Node,
    User,
    All,
}

/// A subject of a group or role binding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,
}

impl Subject {
    pub fn node(name: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::Node,
            name: name.into(),
        }
    }

    pub fn all() -> Self {
        Self {
            kind: SubjectKind::All,
            name: "*".to_string(),
        }
    }

    fn covers(&self, node_id: &str) -> bool {
        match self.kind {
            SubjectKind::All => true,
            SubjectKind::Node => self.name == node_id || self.name == "*",
            SubjectKind::User => false,
        }
    }
}

/// An ordered set of subjects addressable from ACLs as `group:<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub subjects: Vec<Subject>,
}

/// The roles a binding can grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RbacRole {
    /// Full rights.
    Admin,
    /// Member rights: advertise routes, negotiate data channels, request
    /// direct edges.
    Member,
}

/// Grants `role` to `subjects`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub name: String,
    pub role: RbacRole,
    pub subjects: Vec<Subject>,
}

/// A right checked against bindings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Right {
    PutRoutes,
    PutDataChannels,
    PutEdges,
    Admin,
}

/// Group and role-binding view.
pub struct Rbac<'a> {
    db: &'a MeshDb,
}

impl<'a> Rbac<'a> {
    pub(super) fn new(db: &'a MeshDb) -> Self {
        Self { db }
    }

    /// Insert or replace a group.
    pub async fn put_group(&self, group: &Group) -> Result<(), MeshDbError> {
        if group.name.is_empty() {
            return Err(MeshDbError::InvalidArgument("group name is empty".into()));
        }
        self.db
            .propose_put(keys::group_key(&group.name), group)
            .await?;
        Ok(())
    }

    /// Fetch a group by name.
    pub fn get_group(&self, name: &str) -> Result<Group, MeshDbError> {
        self.db
            .get_json(&keys::group_key(name))?
            .ok_or_else(|| MeshDbError::not_found("group", name))
    }

    /// Delete a group by name.
    pub async fn delete_group(&self, name: &str) -> Result<(), MeshDbError> {
        self.db.propose_delete(keys::group_key(name)).await?;
        Ok(())
    }

    /// All groups, ordered by name.
    pub fn groups(&self) -> Result<Vec<Group>, MeshDbError> {
        self.db.list_json(keys::GROUPS_PREFIX)
    }

    /// Insert or replace a role binding.
    pub async fn put_role_binding(&self, binding: &RoleBinding) -> Result<(), MeshDbError> {
        if binding.name.is_empty() {
            return Err(MeshDbError::InvalidArgument(
                "role binding name is empty".into(),
            ));
        }
        self.db
            .propose_put(keys::role_binding_key(&binding.name), binding)
            .await?;
        Ok(())
    }

    /// Delete a role binding by name.
    pub async fn delete_role_binding(&self, name: &str) -> Result<(), MeshDbError> {
        self.db.propose_delete(keys::role_binding_key(name)).await?;
        Ok(())
    }

    /// All role bindings, ordered by name.
    pub fn role_bindings(&self) -> Result<Vec<RoleBinding>, MeshDbError> {
        self.db.list_json(keys::ROLE_BINDINGS_PREFIX)
    }

    /// Whether `node_id` holds `right` under any binding.
    pub fn can(&self, node_id: &str, right: Right) -> Result<bool, MeshDbError> {
        for binding in self.role_bindings()? {
            if !binding.subjects.iter().any(|s| s.covers(node_id)) {
                continue;
            }
            match binding.role {
                RbacRole::Admin => return Ok(true),
                RbacRole::Member => {
                    if right != Right::Admin {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    fn db() -> MeshDb {
        MeshDb::local(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_group_round_trip() {
        let db = db();
        let rbac = db.rbac();
        rbac.put_group(&Group {
            name: "routers".into(),
            subjects: vec![Subject::node("r1"), Subject::node("r2")],
        })
        .await
        .unwrap();
        let group = rbac.get_group("routers").unwrap();
        assert_eq!(group.subjects.len(), 2);
        rbac.delete_group("routers").await.unwrap();
        assert!(matches!(
            rbac.get_group("routers"),
            Err(MeshDbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_member_rights() {
        let db = db();
        let rbac = db.rbac();
        rbac.put_role_binding(&RoleBinding {
            name: "members".into(),
            role: RbacRole::Member,
            subjects: vec![Subject::all()],
        })
        .await
        .unwrap();
        assert!(rbac.can("anyone", Right::PutRoutes).unwrap());
        assert!(rbac.can("anyone", Right::PutDataChannels).unwrap());
        assert!(!rbac.can("anyone", Right::Admin).unwrap());
    }

    #[tokio::test]
    async fn test_admin_binding_is_scoped() {
        let db = db();
        let rbac = db.rbac();
        rbac.put_role_binding(&RoleBinding {
            name: "mesh-admin".into(),
            role: RbacRole::Admin,
            subjects: vec![Subject::node("admin-node")],
        })
        .await
        .unwrap();
        assert!(rbac.can("admin-node", Right::Admin).unwrap());
        assert!(!rbac.can("other", Right::Admin).unwrap());
        assert!(!rbac.can("other", Right::PutRoutes).unwrap());
    }
}
