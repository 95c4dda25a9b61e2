//! Typed Mesh-State Views
//!
//! Structured access to the registry tables stored in [`crate::storage`]:
//! nodes, edges, leases, ASNs, routes, groups, ACLs, role bindings, and the
//! mesh-state singleton. Reads go straight to the local store; writes are
//! built into [`Command`]s and submitted through a [`Proposer`] so every
//! mutation is linearized by the replicated log.
//!
//! Records are JSON documents. Cyclic relations (node ↔ edge, node ↔ lease)
//! are resolved at read time by id; nothing stores back-pointers.

pub mod keys;
pub mod networking;
pub mod peers;
pub mod rbac;
pub mod state;

pub use self::networking::{Acl, AclAction, NetworkAction, Networking, Route};
pub use self::peers::{Edge, Feature, FeaturePort, Lease, MeshGraph, MeshNode, Peers};
pub use self::rbac::{Group, Rbac, RbacRole, Right, RoleBinding, Subject, SubjectKind};
pub use self::state::{MeshState, MeshStateView};

use crate::raft::{Applied, Command, RaftError};
use crate::storage::{SharedStore, StorageError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors from the typed views.
#[derive(Debug, Error)]
pub enum MeshDbError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid record at {key}: {source}")]
    InvalidRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Raft(#[from] RaftError),
}

impl MeshDbError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

/// Write path into the replicated log.
///
/// The raft handle is the production implementation; [`LocalProposer`]
/// applies directly to a store for tests and bootstrap-before-raft writes.
#[async_trait]
pub trait Proposer: Send + Sync {
    async fn propose(&self, command: Command) -> Result<Applied, RaftError>;
}

/// A proposer that applies commands straight to a store, bypassing
/// replication. Single-node and test use only.
pub struct LocalProposer {
    store: SharedStore,
    index: AtomicU64,
}

impl LocalProposer {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            index: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Proposer for LocalProposer {
    async fn propose(&self, command: Command) -> Result<Applied, RaftError> {
        crate::raft::log::apply_command(self.store.as_ref(), &command)?;
        Ok(Applied {
            term: 0,
            index: self.index.fetch_add(1, Ordering::Relaxed) + 1,
        })
    }
}

/// Handle bundling the read store and write path.
#[derive(Clone)]
pub struct MeshDb {
    store: SharedStore,
    proposer: Arc<dyn Proposer>,
}

impl MeshDb {
    pub fn new(store: SharedStore, proposer: Arc<dyn Proposer>) -> Self {
        Self { store, proposer }
    }

    /// A database over `store` whose writes bypass replication. Tests and
    /// pre-raft bootstrap only.
    pub fn local(store: SharedStore) -> Self {
        let proposer = Arc::new(LocalProposer::new(Arc::clone(&store)));
        Self { store, proposer }
    }

    /// The underlying read store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Node, edge, and lease view.
    pub fn peers(&self) -> Peers<'_> {
        Peers::new(self)
    }

    /// Route and ACL view.
    pub fn networking(&self) -> Networking<'_> {
        Networking::new(self)
    }

    /// Group and role-binding view.
    pub fn rbac(&self) -> Rbac<'_> {
        Rbac::new(self)
    }

    /// Mesh-state singleton view.
    pub fn mesh_state(&self) -> MeshStateView<'_> {
        MeshStateView::new(self)
    }

    pub(crate) fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MeshDbError> {
        match self.store.get(key)? {
            Some(value) => {
                let parsed =
                    serde_json::from_str(&value).map_err(|source| MeshDbError::InvalidRecord {
                        key: key.to_string(),
                        source,
                    })?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, MeshDbError> {
        let mut out = Vec::new();
        let mut bad: Option<MeshDbError> = None;
        self.store.iter_prefix(prefix, &mut |key, value| {
            match serde_json::from_str(value) {
                Ok(parsed) => {
                    out.push(parsed);
                    true
                }
                Err(source) => {
                    bad = Some(MeshDbError::InvalidRecord {
                        key: key.to_string(),
                        source,
                    });
                    false
                }
            }
        })?;
        match bad {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    pub(crate) fn put_command<T: Serialize>(key: String, record: &T) -> Command {
        // Serialization of our own records cannot fail.
        let value = serde_json::to_string(record).unwrap_or_default();
        Command::Put { key, value }
    }

    pub(crate) async fn propose(&self, command: Command) -> Result<Applied, MeshDbError> {
        Ok(self.proposer.propose(command).await?)
    }

    pub(crate) async fn propose_put<T: Serialize>(
        &self,
        key: String,
        record: &T,
    ) -> Result<Applied, MeshDbError> {
        self.propose(Self::put_command(key, record)).await
    }

    pub(crate) async fn propose_delete(&self, key: String) -> Result<Applied, MeshDbError> {
        self.propose(Command::Delete { key }).await
    }
}
