//! Mesh-State Singleton
//!
//! The supernets and domain agreed at bootstrap. Written exactly once; the
//! IPv6 supernet embeds random ULA bits that are never recorded elsewhere,
//! so changing it mid-life would silently renumber the mesh. Attempts to do
//! so are rejected.

use super::{keys, MeshDb, MeshDbError};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// The mesh-wide address plan and domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshState {
    /// IPv4 supernet every v4 lease is carved from.
    pub ipv4_network: Ipv4Net,
    /// IPv6 ULA supernet every v6 lease is carved from.
    pub ipv6_network: Ipv6Net,
    /// Mesh DNS domain.
    pub domain: String,
}

/// View over the mesh-state singleton.
pub struct MeshStateView<'a> {
    db: &'a MeshDb,
}

impl<'a> MeshStateView<'a> {
    pub(super) fn new(db: &'a MeshDb) -> Self {
        Self { db }
    }

    /// The current mesh state, if bootstrapped.
    pub fn get(&self) -> Result<Option<MeshState>, MeshDbError> {
        self.db.get_json(keys::MESH_STATE)
    }

    /// Whether the mesh has been bootstrapped.
    pub fn is_bootstrapped(&self) -> Result<bool, MeshDbError> {
        Ok(self.get()?.is_some())
    }

    /// Write the mesh state. Fails once set unless `force`; even with
    /// `force`, the IPv6 supernet of an existing state must be preserved.
    pub async fn set(&self, state: MeshState, force: bool) -> Result<(), MeshDbError> {
        if let Some(existing) = self.get()? {
            if !force {
                return Err(MeshDbError::InvalidArgument(
                    "mesh state is already set".to_string(),
                ));
            }
            if existing.ipv6_network != state.ipv6_network {
                return Err(MeshDbError::InvalidArgument(format!(
                    "mesh IPv6 supernet is write-once (currently {})",
                    existing.ipv6_network
                )));
            }
        }
        self.db
            .propose_put(keys::MESH_STATE.to_string(), &state)
            .await?;
        Ok(())
    }
}
