//! Mesh Observer Loop
//!
//! Consumes cluster observations from the replicated log and keeps the rest
//! of the node in step: peer refreshes on membership changes, watch events
//! for external plugins, and eviction of non-voters that stay silent past
//! the heartbeat-failure threshold. Errors are logged and the loop keeps
//! running; events may coalesce, so every reaction is idempotent.

use crate::meshdb::MeshDb;
use crate::netman::NetworkManager;
use crate::raft::{Observation, Raft, Suffrage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events emitted toward external plugins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    NodeJoin { id: String },
    NodeLeave { id: String },
    LeaderChange { id: Option<String> },
}

/// A running observer loop.
pub struct ObserverHandle {
    events: broadcast::Sender<WatchEvent>,
    task: JoinHandle<()>,
}

impl ObserverHandle {
    /// Spawn the loop. `heartbeat_failure_threshold` is the consecutive-miss
    /// count past which a silent non-voter is evicted by the leader.
    pub fn spawn(
        raft: Raft,
        db: MeshDb,
        manager: Arc<NetworkManager>,
        heartbeat_failure_threshold: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let events_tx = events.clone();
        let task = tokio::spawn(async move {
            run(raft, db, manager, heartbeat_failure_threshold, events_tx).await;
        });
        Self { events, task }
    }

    /// Subscribe to watch events.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Stop the loop.
    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn run(
    raft: Raft,
    db: MeshDb,
    manager: Arc<NetworkManager>,
    threshold: u32,
    events: broadcast::Sender<WatchEvent>,
) {
    let mut observations = raft.observe();
    loop {
        let observation = match observations.recv().await {
            Ok(observation) => observation,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Coalesced under load; a full refresh covers whatever was
                // dropped.
                debug!(skipped, "observation stream lagged, refreshing");
                refresh(&manager).await;
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("observation stream closed, observer stopping");
                return;
            }
        };
        match observation {
            Observation::PeerAdded { id, suffrage } => {
                debug!(peer = %id, %suffrage, "peer joined configuration");
                refresh(&manager).await;
                let _ = events.send(WatchEvent::NodeJoin { id });
            }
            Observation::PeerRemoved { id } => {
                debug!(peer = %id, "peer left configuration");
                refresh(&manager).await;
                let _ = events.send(WatchEvent::NodeLeave { id });
            }
            Observation::LeaderChanged { id } => {
                debug!(leader = ?id, "leader changed");
                let _ = events.send(WatchEvent::LeaderChange { id });
            }
            Observation::HeartbeatFailed { peer, count } => {
                if count <= threshold {
                    continue;
                }
                evict_silent_nonvoter(&raft, &db, &peer).await;
            }
            Observation::HeartbeatResumed { peer } => {
                debug!(peer = %peer, "heartbeat resumed");
            }
            Observation::StateChanged { role } => {
                debug!(%role, "replica role changed");
            }
        }
    }
}

async fn refresh(manager: &Arc<NetworkManager>) {
    if let Err(e) = manager.refresh_peers().await {
        error!(error = %e, "peer refresh failed");
    }
    if let Err(e) = manager.refresh_dns_servers().await {
        error!(error = %e, "dns refresh failed");
    }
}

/// A non-voter past the failure threshold is removed from the configuration
/// by the current leader; its node record goes with it. It re-registers on
/// its next join.
async fn evict_silent_nonvoter(raft: &Raft, db: &MeshDb, peer: &str) {
    if !raft.is_leader().await {
        return;
    }
    let configuration = match raft.configuration().await {
        Ok(configuration) => configuration,
        Err(e) => {
            error!(error = %e, "failed to read configuration");
            return;
        }
    };
    let Some(server) = configuration.servers.iter().find(|s| s.id == peer) else {
        return;
    };
    if server.suffrage != Suffrage::NonVoter {
        warn!(peer = %peer, "voter is past the heartbeat failure threshold, leaving membership to operators");
        return;
    }
    info!(peer = %peer, "removing silent non-voter from the cluster");
    if let Err(e) = raft.remove_server(peer).await {
        error!(peer = %peer, error = %e, "failed to remove silent non-voter");
        return;
    }
    if let Err(e) = db.peers().delete(peer).await {
        error!(peer = %peer, error = %e, "failed to delete evicted node record");
    }
}
