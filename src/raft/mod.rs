//! Replicated Mesh-State Log
//!
//! Leader-elected log replication over the key-value store. All mesh-state
//! writes flow through [`Raft::propose`] on the leader and replay
//! deterministically on every member. Voters form the election/commit quorum;
//! observers (non-voters) replicate state without counting toward it.
//!
//! The [`Raft`] handle is a thin, cloneable channel front over the single
//! replica task in [`replica`].

pub mod log;
pub mod observer;
pub mod replica;
pub mod snapshot;
pub mod transport;
#[cfg(test)]
mod tests;

pub use self::log::{Command, ConfigChange, LogEntry};
pub use self::observer::{Observation, Role};
pub use self::snapshot::SnapshotError;
pub use self::transport::{MemoryNetwork, RaftTransport, TcpTransport, TransportError};

use self::log::{
    FileLogStore, FileStableStore, LogStore, MemoryLogStore, MemoryStableStore, StableStore,
};
use self::observer::ObservationBus;
use self::replica::{ApiCall, ConfigAction, Replica};
use crate::meshdb::Proposer;
use crate::storage::{SharedStore, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

/// Errors surfaced by the replicated log.
#[derive(Debug, Error, Clone)]
pub enum RaftError {
    /// The operation requires the leader. Carries the current leader's
    /// address when known, for redirect-style retries.
    #[error("not the leader{}", .leader.as_deref().map(|l| format!(" (leader: {l})")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    #[error("operation timed out")]
    Timeout,

    #[error("log closed")]
    Aborted,

    #[error("a configuration change is already in flight")]
    ConfigurationPending,

    #[error("storage: {0}")]
    Storage(String),

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error("i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for RaftError {
    fn from(e: std::io::Error) -> Self {
        RaftError::Io(e.to_string())
    }
}

impl From<StorageError> for RaftError {
    fn from(e: StorageError) -> Self {
        RaftError::Storage(e.to_string())
    }
}

impl From<SnapshotError> for RaftError {
    fn from(e: SnapshotError) -> Self {
        RaftError::Snapshot(e.to_string())
    }
}

/// Voting rights of a configured server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suffrage {
    Voter,
    NonVoter,
}

impl std::fmt::Display for Suffrage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suffrage::Voter => write!(f, "voter"),
            Suffrage::NonVoter => write!(f, "non-voter"),
        }
    }
}

/// A server in the cluster configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub addr: String,
    pub suffrage: Suffrage,
}

/// A cluster configuration: the set of known servers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub servers: Vec<Server>,
}

impl Configuration {
    /// A single-voter configuration, used to bootstrap a new cluster.
    pub fn single(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            servers: vec![Server {
                id: id.into(),
                addr: addr.into(),
                suffrage: Suffrage::Voter,
            }],
        }
    }

    /// Whether `id` appears in the configuration at all.
    pub fn contains(&self, id: &str) -> bool {
        self.servers.iter().any(|s| s.id == id)
    }
}

/// Proof of a committed-and-applied command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Applied {
    pub term: u64,
    pub index: u64,
}

/// A point-in-time view of the replica.
#[derive(Clone, Debug)]
pub struct RaftStatus {
    pub id: String,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<String>,
    pub leader_addr: Option<String>,
    pub configuration: Configuration,
    pub last_index: u64,
    pub commit_index: u64,
    pub applied_index: u64,
}

/// Tunables for the replicated log. Defaults match the documented
/// configuration surface.
#[derive(Clone, Debug)]
pub struct RaftOptions {
    pub listen_address: String,
    pub data_dir: PathBuf,
    pub in_memory: bool,
    pub connection_pool_count: usize,
    pub connection_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub election_timeout: Duration,
    pub apply_timeout: Duration,
    pub commit_timeout: Duration,
    pub max_append_entries: usize,
    pub leader_lease_timeout: Duration,
    pub snapshot_interval: Duration,
    pub snapshot_threshold: usize,
    pub snapshot_retention: usize,
    pub observer_chan_buffer: usize,
    pub prefer_ipv6: bool,
    pub leave_on_shutdown: bool,
    pub heartbeat_failure_threshold: u32,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            listen_address: "[::]:9443".to_string(),
            data_dir: PathBuf::from("/var/lib/weft/store"),
            in_memory: false,
            connection_pool_count: 1,
            connection_timeout: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(3),
            election_timeout: Duration::from_secs(3),
            apply_timeout: Duration::from_secs(15),
            commit_timeout: Duration::from_secs(15),
            max_append_entries: 15,
            leader_lease_timeout: Duration::from_secs(3),
            snapshot_interval: Duration::from_secs(180),
            snapshot_threshold: 5,
            snapshot_retention: 3,
            observer_chan_buffer: 100,
            prefer_ipv6: false,
            leave_on_shutdown: false,
            heartbeat_failure_threshold: 30,
        }
    }
}

/// Cloneable handle to the replica task.
#[derive(Clone)]
pub struct Raft {
    id: String,
    api: mpsc::Sender<ApiCall>,
    bus: Arc<ObservationBus>,
    options: Arc<RaftOptions>,
}

impl Raft {
    /// Start a replica over an explicit transport and stores. Used directly
    /// by tests (with [`MemoryNetwork`]); production code goes through
    /// [`Raft::start`].
    #[allow(clippy::too_many_arguments)]
    pub fn start_with(
        id: impl Into<String>,
        advertise_addr: impl Into<String>,
        options: RaftOptions,
        fsm: SharedStore,
        log_store: Box<dyn LogStore>,
        stable_store: Box<dyn StableStore>,
        transport: Arc<dyn RaftTransport>,
        inbound: transport::InboundRx,
        bootstrap: Option<Configuration>,
    ) -> Result<Self, RaftError> {
        let id = id.into();
        let bus = Arc::new(ObservationBus::new(options.observer_chan_buffer));
        let (api_tx, api_rx) = mpsc::channel(64);
        let replica = Replica::new(
            id.clone(),
            advertise_addr.into(),
            options.clone(),
            fsm,
            log_store,
            stable_store,
            transport,
            inbound,
            api_rx,
            Arc::clone(&bus),
            bootstrap,
        )?;
        tokio::spawn(replica.run());
        Ok(Self {
            id,
            api: api_tx,
            bus,
            options: Arc::new(options),
        })
    }

    /// Start a replica listening on `options.listen_address`, with durable
    /// stores under `options.data_dir` unless `options.in_memory`.
    ///
    /// Returns the handle and the bound advertise address.
    pub async fn start(
        id: impl Into<String>,
        options: RaftOptions,
        fsm: SharedStore,
        bootstrap: Option<Configuration>,
    ) -> Result<(Self, String), RaftError> {
        let id = id.into();
        let (transport, inbound, local_addr) = TcpTransport::bind(
            &options.listen_address,
            options.connection_timeout,
            options.connection_pool_count,
            options.observer_chan_buffer,
        )
        .await
        .map_err(|e| RaftError::Io(e.to_string()))?;
        let advertise = local_addr.to_string();

        let (log_store, stable_store): (Box<dyn LogStore>, Box<dyn StableStore>) =
            if options.in_memory {
                (
                    Box::new(MemoryLogStore::new()),
                    Box::new(MemoryStableStore::new()),
                )
            } else {
                let store_dir = options.data_dir.join("raft-store");
                std::fs::create_dir_all(&store_dir)?;
                std::fs::create_dir_all(options.data_dir.join("raft-data"))?;
                (
                    Box::new(FileLogStore::open(store_dir.join("log.bin"))?),
                    Box::new(FileStableStore::open(store_dir.join("stable.json"))),
                )
            };

        info!(node = %id, addr = %advertise, "starting replicated log");
        let raft = Self::start_with(
            id,
            advertise.clone(),
            options,
            fsm,
            log_store,
            stable_store,
            transport,
            inbound,
            bootstrap,
        )?;
        Ok((raft, advertise))
    }

    /// This replica's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ApiCall,
        timeout: Duration,
    ) -> Result<T, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.api
            .send(make(tx))
            .await
            .map_err(|_| RaftError::Aborted)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RaftError::Aborted),
            Err(_) => Err(RaftError::Timeout),
        }
    }

    /// Append a command; resolves once it is committed and applied locally.
    pub async fn propose(&self, command: Command) -> Result<Applied, RaftError> {
        self.call(
            |reply| ApiCall::Propose { command, reply },
            self.options.apply_timeout,
        )
        .await?
    }

    /// Block until every command proposed before the barrier is applied.
    pub async fn barrier(&self, timeout: Duration) -> Result<u64, RaftError> {
        let applied = self
            .call(
                |reply| ApiCall::Propose {
                    command: Command::Noop,
                    reply,
                },
                timeout,
            )
            .await??;
        Ok(applied.index)
    }

    /// Current replica status.
    pub async fn status(&self) -> Result<RaftStatus, RaftError> {
        self.call(
            |reply| ApiCall::Status { reply },
            self.options.apply_timeout,
        )
        .await
    }

    /// The current cluster configuration.
    pub async fn configuration(&self) -> Result<Configuration, RaftError> {
        Ok(self.status().await?.configuration)
    }

    /// The current leader's id, when known.
    pub async fn leader(&self) -> Result<Option<String>, RaftError> {
        Ok(self.status().await?.leader_id)
    }

    /// The current leader's address, when known.
    pub async fn leader_addr(&self) -> Result<Option<String>, RaftError> {
        Ok(self.status().await?.leader_addr)
    }

    /// Whether this replica is currently the leader.
    pub async fn is_leader(&self) -> bool {
        matches!(
            self.status().await,
            Ok(RaftStatus {
                role: Role::Leader,
                ..
            })
        )
    }

    /// Add `id` as a voting member.
    pub async fn add_voter(&self, id: &str, addr: &str) -> Result<(), RaftError> {
        self.change(ConfigAction::Add {
            id: id.to_string(),
            addr: addr.to_string(),
            suffrage: Suffrage::Voter,
        })
        .await
    }

    /// Add `id` as a non-voting observer.
    pub async fn add_observer(&self, id: &str, addr: &str) -> Result<(), RaftError> {
        self.change(ConfigAction::Add {
            id: id.to_string(),
            addr: addr.to_string(),
            suffrage: Suffrage::NonVoter,
        })
        .await
    }

    /// Remove `id` from the configuration.
    pub async fn remove_server(&self, id: &str) -> Result<(), RaftError> {
        self.change(ConfigAction::Remove { id: id.to_string() }).await
    }

    async fn change(&self, action: ConfigAction) -> Result<(), RaftError> {
        self.call(
            |reply| ApiCall::ChangeConfig { action, reply },
            self.options.commit_timeout,
        )
        .await?
    }

    /// Force a snapshot; returns the covered index.
    pub async fn snapshot(&self) -> Result<u64, RaftError> {
        self.call(
            |reply| ApiCall::TakeSnapshot { reply },
            self.options.commit_timeout,
        )
        .await?
    }

    /// Replace local state from snapshot bytes. Startup-time only; a failed
    /// restore aborts startup.
    pub async fn restore(&self, data: Vec<u8>) -> Result<(), RaftError> {
        self.call(
            |reply| ApiCall::Restore { data, reply },
            self.options.commit_timeout,
        )
        .await?
    }

    /// Subscribe to cluster observations.
    pub fn observe(&self) -> broadcast::Receiver<Observation> {
        self.bus.subscribe()
    }

    /// Stop the replica, honoring `leave_on_shutdown`.
    pub async fn shutdown(&self) {
        let leave = self.options.leave_on_shutdown;
        let _ = self
            .call(|reply| ApiCall::Shutdown { leave, reply }, Duration::from_secs(5))
            .await;
    }
}

#[async_trait]
impl Proposer for Raft {
    async fn propose(&self, command: Command) -> Result<Applied, RaftError> {
        Raft::propose(self, command).await
    }
}
