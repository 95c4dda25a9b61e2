//! Cluster Observations
//!
//! The replica broadcasts membership, leadership, and heartbeat events to
//! anyone holding an [`observe`](super::Raft::observe) receiver. Events may be
//! coalesced under load (the channel drops the oldest on overflow), so
//! handlers must be idempotent.

use super::Suffrage;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// The replica's externally visible role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// An event observed on the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// A server entered the committed configuration.
    PeerAdded { id: String, suffrage: Suffrage },
    /// A server left the committed configuration.
    PeerRemoved { id: String },
    /// The known leader changed. `id` is `None` while no leader is known.
    LeaderChanged { id: Option<String> },
    /// The local replica changed role.
    StateChanged { role: Role },
    /// An append to `peer` failed; `count` consecutive failures so far.
    HeartbeatFailed { peer: String, count: u32 },
    /// An append to `peer` succeeded after one or more failures.
    HeartbeatResumed { peer: String },
}

/// Broadcast side of the observation stream.
pub struct ObservationBus {
    tx: broadcast::Sender<Observation>,
}

impl ObservationBus {
    /// Create a bus with the given channel capacity.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Subscribe to future observations.
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.tx.subscribe()
    }

    /// Emit an observation. Dropped silently when nobody is listening.
    pub fn emit(&self, observation: Observation) {
        trace!(?observation, "cluster observation");
        let _ = self.tx.send(observation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = ObservationBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(Observation::LeaderChanged {
            id: Some("n1".into()),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            Observation::LeaderChanged {
                id: Some("n1".into())
            }
        );
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = ObservationBus::new(8);
        bus.emit(Observation::StateChanged {
            role: Role::Follower,
        });
    }
}
