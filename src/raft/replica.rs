//! Replica Task
//!
//! One cooperative task per process owns the full consensus state: role,
//! term, log, configuration, and replication progress. Everything it awaits
//! flows through channels — inbound RPCs, API calls from the [`super::Raft`]
//! handle, and results of spawned outbound sends — so the task itself never
//! blocks on the network.

use super::log::{
    apply_command, is_voter, quorum_configs, Command, ConfigChange, LogEntry, LogStore,
    StableState, StableStore,
};
use super::observer::{Observation, ObservationBus, Role};
use super::snapshot::{restore_snapshot, write_snapshot, SnapshotError, SnapshotStore};
use super::transport::{
    AppendRequest, AppendResponse, Inbound, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftTransport, Request, Response, TransportError, VoteRequest, VoteResponse,
};
use super::{Applied, Configuration, RaftError, RaftOptions, RaftStatus, Server, Suffrage};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Calls from the public handle into the replica task.
pub(super) enum ApiCall {
    Propose {
        command: Command,
        reply: oneshot::Sender<Result<Applied, RaftError>>,
    },
    Status {
        reply: oneshot::Sender<RaftStatus>,
    },
    ChangeConfig {
        action: ConfigAction,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    TakeSnapshot {
        reply: oneshot::Sender<Result<u64, RaftError>>,
    },
    Restore {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
    Shutdown {
        leave: bool,
        reply: oneshot::Sender<()>,
    },
}

/// A requested membership change.
pub(super) enum ConfigAction {
    Add {
        id: String,
        addr: String,
        suffrage: Suffrage,
    },
    Remove {
        id: String,
    },
}

/// Results of spawned outbound sends, routed back into the select loop.
enum Outcome {
    Vote {
        term: u64,
        from: String,
        result: Result<VoteResponse, TransportError>,
    },
    Append {
        term: u64,
        peer: String,
        sent_up_to: u64,
        result: Result<AppendResponse, TransportError>,
    },
    SnapshotInstall {
        term: u64,
        peer: String,
        last_index: u64,
        result: Result<InstallSnapshotResponse, TransportError>,
    },
}

/// Where snapshots live: on disk in durable mode, in memory otherwise.
enum SnapshotKeeper {
    Disk(SnapshotStore),
    Memory(Option<(u64, u64, Vec<u8>)>),
}

impl SnapshotKeeper {
    fn write(&mut self, term: u64, index: u64, data: Vec<u8>) -> Result<(), SnapshotError> {
        match self {
            SnapshotKeeper::Disk(store) => store.write(term, index, &data),
            SnapshotKeeper::Memory(slot) => {
                *slot = Some((term, index, data));
                Ok(())
            }
        }
    }

    fn latest(&self) -> Result<Option<(u64, u64, Vec<u8>)>, SnapshotError> {
        match self {
            SnapshotKeeper::Disk(store) => store.latest(),
            SnapshotKeeper::Memory(slot) => Ok(slot.clone()),
        }
    }
}

pub(super) struct Replica {
    id: String,
    advertise_addr: String,
    options: RaftOptions,
    fsm: crate::storage::SharedStore,
    log: Box<dyn LogStore>,
    stable: Box<dyn StableStore>,
    stable_state: StableState,
    snapshots: SnapshotKeeper,
    transport: Arc<dyn RaftTransport>,
    inbound: mpsc::Receiver<Inbound>,
    api: mpsc::Receiver<ApiCall>,
    bus: Arc<ObservationBus>,

    role: Role,
    leader: Option<(String, String)>,
    commit_index: u64,
    last_applied: u64,

    /// Latest configuration entry in the log (possibly uncommitted).
    latest_config: ConfigChange,
    latest_config_index: u64,
    /// Configuration as of the last applied entry; used for observation diffs.
    committed_config: Configuration,

    /// Leader volatile state.
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    inflight: HashSet<String>,
    peer_last_ack: HashMap<String, Instant>,
    failed_heartbeats: HashMap<String, u32>,

    /// Candidate volatile state.
    votes_granted: HashSet<String>,

    pending: BTreeMap<u64, oneshot::Sender<Result<Applied, RaftError>>>,
    config_waiter: Option<oneshot::Sender<Result<(), RaftError>>>,

    outcomes_tx: mpsc::UnboundedSender<Outcome>,
    outcomes_rx: mpsc::UnboundedReceiver<Outcome>,

    election_deadline: Instant,
    next_heartbeat: Instant,
    next_snapshot: Instant,
    inbound_closed: bool,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Replica {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: String,
        advertise_addr: String,
        options: RaftOptions,
        fsm: crate::storage::SharedStore,
        mut log: Box<dyn LogStore>,
        mut stable: Box<dyn StableStore>,
        transport: Arc<dyn RaftTransport>,
        inbound: mpsc::Receiver<Inbound>,
        api: mpsc::Receiver<ApiCall>,
        bus: Arc<ObservationBus>,
        bootstrap: Option<Configuration>,
    ) -> Result<Self, RaftError> {
        let mut stable_state = stable.load()?;
        let snapshots = if options.in_memory {
            SnapshotKeeper::Memory(None)
        } else {
            SnapshotKeeper::Disk(SnapshotStore::open(
                options.data_dir.join("raft-store").join("snapshots"),
                options.snapshot_retention,
            )?)
        };

        // Restore the newest local snapshot before replaying the log tail.
        let mut commit_index = 0;
        if let Some((term, index, data)) = snapshots.latest()? {
            restore_snapshot(fsm.as_ref(), &data)?;
            stable_state.snapshot_index = index;
            stable_state.snapshot_term = term;
            commit_index = index;
        }

        let mut latest_config = ConfigChange {
            prev: None,
            next: Configuration::default(),
        };
        let mut latest_config_index = 0;

        // Seed an empty log on first boot.
        if bootstrap.is_some()
            && stable_state.term == 0
            && log.last_index() == 0
            && stable_state.snapshot_index == 0
        {
            let config = bootstrap.unwrap();
            info!(servers = config.servers.len(), "bootstrapping new cluster");
            let entry = LogEntry {
                term: 1,
                index: 1,
                command: Command::Configuration(ConfigChange {
                    prev: None,
                    next: config,
                }),
            };
            log.append(std::slice::from_ref(&entry))?;
            stable_state.term = 1;
            stable.save(&stable_state)?;
        }

        // Recover the latest configuration from the retained log.
        let first = log.first_index().max(1);
        for index in first..=log.last_index() {
            if let Some(LogEntry {
                command: Command::Configuration(change),
                ..
            }) = log.entry(index)
            {
                latest_config = change;
                latest_config_index = index;
            }
        }

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let mut replica = Self {
            id,
            advertise_addr,
            fsm,
            log,
            stable,
            stable_state,
            snapshots,
            transport,
            inbound,
            api,
            bus,
            role: Role::Follower,
            leader: None,
            commit_index,
            last_applied: commit_index,
            committed_config: latest_config.next.clone(),
            latest_config,
            latest_config_index,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            inflight: HashSet::new(),
            peer_last_ack: HashMap::new(),
            failed_heartbeats: HashMap::new(),
            votes_granted: HashSet::new(),
            pending: BTreeMap::new(),
            config_waiter: None,
            outcomes_tx,
            outcomes_rx,
            election_deadline: now,
            next_heartbeat: now,
            next_snapshot: now + options.snapshot_interval,
            inbound_closed: false,
            shutdown: None,
            options,
        };
        replica.reset_election_deadline();
        // A fresh single-voter bootstrap should not wait a full timeout.
        if replica.log.last_index() == 1 && replica.voters().len() == 1 {
            replica.election_deadline = Instant::now();
        }
        Ok(replica)
    }

    pub(super) async fn run(mut self) {
        loop {
            let election = tokio::time::sleep_until(self.election_deadline);
            let heartbeat = tokio::time::sleep_until(self.next_heartbeat);
            let snapshot_tick = tokio::time::sleep_until(self.next_snapshot);
            tokio::select! {
                inbound = self.inbound.recv(), if !self.inbound_closed => {
                    match inbound {
                        Some(rpc) => self.handle_inbound(rpc),
                        None => {
                            // Transport gone; keep serving API until shutdown.
                            self.inbound_closed = true;
                            self.election_deadline = Instant::now() + Duration::from_secs(3600);
                        }
                    }
                }
                call = self.api.recv() => {
                    match call {
                        Some(call) => {
                            if self.handle_api(call) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Some(outcome) = self.outcomes_rx.recv() => self.handle_outcome(outcome),
                _ = election, if self.role != Role::Leader => self.start_election(),
                _ = heartbeat, if self.role == Role::Leader => self.leader_tick(),
                _ = snapshot_tick => {
                    if let Err(e) = self.maybe_snapshot(true) {
                        warn!(error = %e, "periodic snapshot failed");
                    }
                    self.next_snapshot = Instant::now() + self.options.snapshot_interval;
                }
            }
        }
        self.fail_pending(RaftError::Aborted);
        if let Some(reply) = self.shutdown.take() {
            let _ = reply.send(());
        }
        debug!("replica task stopped");
    }

    // ========================================================================
    // Role and configuration helpers
    // ========================================================================

    fn voters(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for config in quorum_configs(&self.latest_config) {
            for server in &config.servers {
                if server.suffrage == Suffrage::Voter && !out.contains(&server.id) {
                    out.push(server.id.clone());
                }
            }
        }
        out
    }

    fn all_servers(&self) -> Vec<Server> {
        let mut out: Vec<Server> = Vec::new();
        for config in quorum_configs(&self.latest_config) {
            for server in &config.servers {
                if !out.iter().any(|s| s.id == server.id) {
                    out.push(server.clone());
                }
            }
        }
        out
    }

    /// Quorum check against every active configuration (joint counts both).
    fn quorum_satisfied(&self, has: &dyn Fn(&str) -> bool) -> bool {
        for config in quorum_configs(&self.latest_config) {
            let voters: Vec<&Server> = config
                .servers
                .iter()
                .filter(|s| s.suffrage == Suffrage::Voter)
                .collect();
            if voters.is_empty() {
                return false;
            }
            let count = voters.iter().filter(|s| has(&s.id)).count();
            if count <= voters.len() / 2 {
                return false;
            }
        }
        true
    }

    fn reset_election_deadline(&mut self) {
        let base = self.options.election_timeout;
        let jitter = rand::thread_rng().gen_range(0..base.as_millis().max(1) as u64);
        self.election_deadline = Instant::now() + base + Duration::from_millis(jitter);
    }

    fn persist_stable(&mut self) {
        if let Err(e) = self.stable.save(&self.stable_state) {
            error!(error = %e, "failed to persist stable state");
        }
    }

    fn set_term(&mut self, term: u64) {
        if term > self.stable_state.term {
            self.stable_state.term = term;
            self.stable_state.voted_for = None;
            self.persist_stable();
        }
    }

    fn set_leader(&mut self, leader: Option<(String, String)>) {
        let changed = self.leader.as_ref().map(|(id, _)| id.clone())
            != leader.as_ref().map(|(id, _)| id.clone());
        self.leader = leader;
        if changed {
            self.bus.emit(Observation::LeaderChanged {
                id: self.leader.as_ref().map(|(id, _)| id.clone()),
            });
        }
    }

    fn become_follower(&mut self, term: u64) {
        let was = self.role;
        self.set_term(term);
        self.role = Role::Follower;
        self.votes_granted.clear();
        self.inflight.clear();
        if was != Role::Follower {
            self.bus.emit(Observation::StateChanged {
                role: Role::Follower,
            });
            if was == Role::Leader {
                self.fail_pending(RaftError::NotLeader {
                    leader: self.leader_addr(),
                });
                if let Some(waiter) = self.config_waiter.take() {
                    let _ = waiter.send(Err(RaftError::NotLeader {
                        leader: self.leader_addr(),
                    }));
                }
            }
        }
        self.reset_election_deadline();
    }

    fn leader_addr(&self) -> Option<String> {
        self.leader.as_ref().map(|(_, addr)| addr.clone())
    }

    fn fail_pending(&mut self, error: RaftError) {
        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(error.clone()));
        }
    }

    // ========================================================================
    // Elections
    // ========================================================================

    fn start_election(&mut self) {
        if !is_voter(&self.latest_config.next, &self.id)
            && !self
                .latest_config
                .prev
                .as_ref()
                .map(|c| is_voter(c, &self.id))
                .unwrap_or(false)
        {
            // Observers never campaign.
            self.reset_election_deadline();
            return;
        }
        self.stable_state.term += 1;
        self.stable_state.voted_for = Some(self.id.clone());
        self.persist_stable();
        self.role = Role::Candidate;
        self.votes_granted.clear();
        self.votes_granted.insert(self.id.clone());
        self.set_leader(None);
        self.bus.emit(Observation::StateChanged {
            role: Role::Candidate,
        });
        self.reset_election_deadline();
        let term = self.stable_state.term;
        debug!(term, "starting election");

        if self.try_win_election() {
            return;
        }

        let request = VoteRequest {
            term,
            candidate: self.id.clone(),
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
        };
        for server in self.all_servers() {
            if server.id == self.id || server.suffrage != Suffrage::Voter {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let outcomes = self.outcomes_tx.clone();
            let request = request.clone();
            let timeout = self.options.election_timeout;
            tokio::spawn(async move {
                let send = transport.send(&server.addr, Request::Vote(request));
                let result = match tokio::time::timeout(timeout, send).await {
                    Ok(Ok(Response::Vote(v))) => Ok(v),
                    Ok(Ok(_)) => Err(TransportError::Closed),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(TransportError::Timeout(server.addr.clone())),
                };
                let _ = outcomes.send(Outcome::Vote {
                    term,
                    from: server.id,
                    result,
                });
            });
        }
    }

    fn try_win_election(&mut self) -> bool {
        let granted = self.votes_granted.clone();
        if self.role == Role::Candidate && self.quorum_satisfied(&|id| granted.contains(id)) {
            self.become_leader();
            return true;
        }
        false
    }

    fn become_leader(&mut self) {
        info!(term = self.stable_state.term, "won election, becoming leader");
        self.role = Role::Leader;
        self.set_leader(Some((self.id.clone(), self.advertise_addr.clone())));
        self.bus.emit(Observation::StateChanged { role: Role::Leader });
        let last = self.last_index();
        self.next_index.clear();
        self.match_index.clear();
        self.inflight.clear();
        self.peer_last_ack.clear();
        let now = Instant::now();
        for server in self.all_servers() {
            if server.id == self.id {
                continue;
            }
            self.next_index.insert(server.id.clone(), last + 1);
            self.match_index.insert(server.id.clone(), 0);
            self.peer_last_ack.insert(server.id, now);
        }
        // Commit an entry from the new term to settle the commit index.
        if let Err(e) = self.append_local(Command::Noop) {
            error!(error = %e, "failed to append term-opening entry");
        }
        self.advance_commit();
        self.next_heartbeat = Instant::now();
    }

    // ========================================================================
    // Leader replication
    // ========================================================================

    fn leader_tick(&mut self) {
        // Step down when a quorum has been unreachable past the lease.
        let lease = self.options.leader_lease_timeout;
        let now = Instant::now();
        let acks = self.peer_last_ack.clone();
        let me = self.id.clone();
        let reachable = |id: &str| -> bool {
            id == me
                || acks
                    .get(id)
                    .map(|at| now.duration_since(*at) < lease * 3)
                    .unwrap_or(false)
        };
        if !self.quorum_satisfied(&reachable) {
            warn!("quorum unreachable beyond leader lease, stepping down");
            let term = self.stable_state.term;
            self.set_leader(None);
            self.become_follower(term);
            return;
        }

        for server in self.all_servers() {
            if server.id == self.id || self.inflight.contains(&server.id) {
                continue;
            }
            self.replicate_to(&server);
        }
        // A quorum of one (or entries already matched everywhere) commits
        // without waiting for acks.
        self.advance_commit();
        self.next_heartbeat = Instant::now() + self.heartbeat_interval();
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.options.heartbeat_timeout / 3).max(Duration::from_millis(20))
    }

    fn replicate_to(&mut self, server: &Server) {
        let next = *self.next_index.get(&server.id).unwrap_or(&1);
        let first = self.log.first_index();
        let term = self.stable_state.term;

        // The entries the follower needs were compacted away; ship a snapshot.
        if self.stable_state.snapshot_index > 0
            && (next <= self.stable_state.snapshot_index)
            && (first == 0 || next < first)
        {
            let Ok(Some((snap_term, snap_index, data))) = self.snapshots.latest() else {
                warn!(peer = %server.id, "snapshot needed but none available");
                return;
            };
            let request = InstallSnapshotRequest {
                term,
                leader: self.id.clone(),
                leader_addr: self.advertise_addr.clone(),
                last_index: snap_index,
                last_term: snap_term,
                configuration: self.latest_config.next.clone(),
                data,
            };
            self.inflight.insert(server.id.clone());
            let transport = Arc::clone(&self.transport);
            let outcomes = self.outcomes_tx.clone();
            let peer = server.id.clone();
            let addr = server.addr.clone();
            let timeout = self.options.commit_timeout;
            tokio::spawn(async move {
                let send = transport.send(&addr, Request::Snapshot(request));
                let result = match tokio::time::timeout(timeout, send).await {
                    Ok(Ok(Response::Snapshot(r))) => Ok(r),
                    Ok(Ok(_)) => Err(TransportError::Closed),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(TransportError::Timeout(addr)),
                };
                let _ = outcomes.send(Outcome::SnapshotInstall {
                    term,
                    peer,
                    last_index: snap_index,
                    result,
                });
            });
            return;
        }

        let prev_log_index = next.saturating_sub(1);
        let prev_log_term = if prev_log_index == 0 {
            0
        } else if prev_log_index == self.stable_state.snapshot_index {
            self.stable_state.snapshot_term
        } else {
            self.log.term_of(prev_log_index).unwrap_or(0)
        };
        let entries = self.log.entries(next, self.options.max_append_entries);
        let sent_up_to = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
        let request = AppendRequest {
            term,
            leader: self.id.clone(),
            leader_addr: self.advertise_addr.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        self.inflight.insert(server.id.clone());
        let transport = Arc::clone(&self.transport);
        let outcomes = self.outcomes_tx.clone();
        let peer = server.id.clone();
        let addr = server.addr.clone();
        let timeout = self.options.heartbeat_timeout;
        tokio::spawn(async move {
            let send = transport.send(&addr, Request::Append(request));
            let result = match tokio::time::timeout(timeout, send).await {
                Ok(Ok(Response::Append(r))) => Ok(r),
                Ok(Ok(_)) => Err(TransportError::Closed),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TransportError::Timeout(addr)),
            };
            let _ = outcomes.send(Outcome::Append {
                term,
                peer,
                sent_up_to,
                result,
            });
        });
    }

    fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Vote { term, from, result } => {
                if self.role != Role::Candidate || term != self.stable_state.term {
                    return;
                }
                match result {
                    Ok(response) => {
                        if response.term > self.stable_state.term {
                            self.become_follower(response.term);
                        } else if response.granted {
                            self.votes_granted.insert(from);
                            self.try_win_election();
                        }
                    }
                    Err(e) => debug!(peer = %from, error = %e, "vote request failed"),
                }
            }
            Outcome::Append {
                term,
                peer,
                sent_up_to,
                result,
            } => {
                self.inflight.remove(&peer);
                if self.role != Role::Leader || term != self.stable_state.term {
                    return;
                }
                match result {
                    Ok(response) => {
                        self.note_heartbeat_ok(&peer);
                        if response.term > self.stable_state.term {
                            self.become_follower(response.term);
                            return;
                        }
                        if response.success {
                            let matched = self.match_index.entry(peer.clone()).or_insert(0);
                            *matched = (*matched).max(sent_up_to);
                            let matched = *matched;
                            self.next_index.insert(peer.clone(), matched + 1);
                            self.advance_commit();
                            // Keep pushing if the follower is still behind.
                            if sent_up_to < self.last_index() {
                                self.next_heartbeat = Instant::now();
                            }
                        } else {
                            // Follow the follower's hint, stepping back at
                            // least one entry.
                            let next = self.next_index.entry(peer.clone()).or_insert(1);
                            *next = response.last_index.saturating_add(1).min((*next).saturating_sub(1)).max(1);
                            self.next_heartbeat = Instant::now();
                        }
                    }
                    Err(e) => {
                        self.note_heartbeat_failed(&peer);
                        debug!(peer = %peer, error = %e, "append failed");
                    }
                }
            }
            Outcome::SnapshotInstall {
                term,
                peer,
                last_index,
                result,
            } => {
                self.inflight.remove(&peer);
                if self.role != Role::Leader || term != self.stable_state.term {
                    return;
                }
                match result {
                    Ok(response) => {
                        self.note_heartbeat_ok(&peer);
                        if response.term > self.stable_state.term {
                            self.become_follower(response.term);
                            return;
                        }
                        self.match_index.insert(peer.clone(), last_index);
                        self.next_index.insert(peer, last_index + 1);
                        self.advance_commit();
                    }
                    Err(e) => {
                        self.note_heartbeat_failed(&peer);
                        debug!(peer = %peer, error = %e, "snapshot install failed");
                    }
                }
            }
        }
    }

    fn note_heartbeat_ok(&mut self, peer: &str) {
        self.peer_last_ack.insert(peer.to_string(), Instant::now());
        if self.failed_heartbeats.remove(peer).is_some() {
            self.bus.emit(Observation::HeartbeatResumed {
                peer: peer.to_string(),
            });
        }
    }

    fn note_heartbeat_failed(&mut self, peer: &str) {
        let count = self.failed_heartbeats.entry(peer.to_string()).or_insert(0);
        *count += 1;
        self.bus.emit(Observation::HeartbeatFailed {
            peer: peer.to_string(),
            count: *count,
        });
    }

    fn advance_commit(&mut self) {
        let last = self.last_index();
        let mut advanced = false;
        for candidate in (self.commit_index + 1)..=last {
            // Only entries from the current term commit by counting.
            if self.log.term_of(candidate) != Some(self.stable_state.term) {
                continue;
            }
            let match_index = self.match_index.clone();
            let me = self.id.clone();
            let reached = |id: &str| -> bool {
                if id == me {
                    return true;
                }
                match_index.get(id).map(|m| *m >= candidate).unwrap_or(false)
            };
            if self.quorum_satisfied(&reached) {
                self.commit_index = candidate;
                advanced = true;
            } else {
                break;
            }
        }
        if advanced {
            self.apply_committed();
        }
    }

    // ========================================================================
    // Applying entries
    // ========================================================================

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.entry(index) else {
                error!(index, "committed entry missing from log");
                return;
            };
            if let Err(e) = apply_command(self.fsm.as_ref(), &entry.command) {
                error!(index, error = %e, "state machine apply failed");
                return;
            }
            self.last_applied = index;
            if let Command::Configuration(change) = &entry.command {
                self.apply_configuration(index, change.clone());
            }
            if let Some(reply) = self.pending.remove(&index) {
                let _ = reply.send(Ok(Applied {
                    term: entry.term,
                    index,
                }));
            }
        }
        if let Err(e) = self.maybe_snapshot(false) {
            warn!(error = %e, "threshold snapshot failed");
        }
    }

    fn apply_configuration(&mut self, index: u64, change: ConfigChange) {
        let old = self.committed_config.clone();
        let effective = change.next.clone();

        for server in &effective.servers {
            let known = old.servers.iter().find(|s| s.id == server.id);
            if known.map(|s| s.suffrage) != Some(server.suffrage) {
                self.bus.emit(Observation::PeerAdded {
                    id: server.id.clone(),
                    suffrage: server.suffrage,
                });
            }
        }
        for server in &old.servers {
            if !effective.servers.iter().any(|s| s.id == server.id) {
                self.bus.emit(Observation::PeerRemoved {
                    id: server.id.clone(),
                });
            }
        }
        self.committed_config = effective.clone();

        if change.prev.is_some() {
            // Joint entry committed; the leader appends the final entry.
            if self.role == Role::Leader && index == self.latest_config_index {
                if let Err(e) = self.append_local(Command::Configuration(ConfigChange {
                    prev: None,
                    next: effective,
                })) {
                    error!(error = %e, "failed to append final configuration");
                }
                self.next_heartbeat = Instant::now();
            }
        } else if let Some(waiter) = self.config_waiter.take() {
            let _ = waiter.send(Ok(()));
        }

        // A leader removed from its own configuration steps down after the
        // final entry commits.
        if change.prev.is_none()
            && self.role == Role::Leader
            && !change.next.servers.iter().any(|s| s.id == self.id)
        {
            info!("removed from configuration, stepping down");
            let term = self.stable_state.term;
            self.set_leader(None);
            self.become_follower(term);
        }
    }

    fn maybe_snapshot(&mut self, periodic: bool) -> Result<(), RaftError> {
        let since = self
            .last_applied
            .saturating_sub(self.stable_state.snapshot_index);
        if since == 0 {
            return Ok(());
        }
        if !periodic && (since as usize) < self.options.snapshot_threshold {
            return Ok(());
        }
        self.take_snapshot().map(|_| ())
    }

    fn take_snapshot(&mut self) -> Result<u64, RaftError> {
        let index = self.last_applied;
        if index == 0 || index == self.stable_state.snapshot_index {
            return Ok(index);
        }
        let term = if index == self.stable_state.snapshot_index {
            self.stable_state.snapshot_term
        } else {
            self.log.term_of(index).unwrap_or(self.stable_state.term)
        };
        let data = write_snapshot(self.fsm.as_ref())?;
        self.snapshots.write(term, index, data)?;
        self.log.compact_to(index)?;
        self.stable_state.snapshot_index = index;
        self.stable_state.snapshot_term = term;
        self.persist_stable();
        debug!(index, term, "snapshot taken and log compacted");
        Ok(index)
    }

    // ========================================================================
    // Inbound RPCs
    // ========================================================================

    fn handle_inbound(&mut self, rpc: Inbound) {
        let response = match rpc.request {
            Request::Vote(request) => Response::Vote(self.handle_vote(request)),
            Request::Append(request) => Response::Append(self.handle_append(request)),
            Request::Snapshot(request) => Response::Snapshot(self.handle_install(request)),
        };
        let _ = rpc.reply.send(response);
    }

    fn handle_vote(&mut self, request: VoteRequest) -> VoteResponse {
        if request.term > self.stable_state.term {
            self.become_follower(request.term);
        }
        let term = self.stable_state.term;
        if request.term < term {
            return VoteResponse {
                term,
                granted: false,
            };
        }
        let can_vote = match &self.stable_state.voted_for {
            None => true,
            Some(id) => id == &request.candidate,
        };
        let up_to_date = request.last_log_term > self.last_term()
            || (request.last_log_term == self.last_term()
                && request.last_log_index >= self.last_index());
        let granted = can_vote && up_to_date;
        if granted {
            self.stable_state.voted_for = Some(request.candidate.clone());
            self.persist_stable();
            self.reset_election_deadline();
        }
        VoteResponse { term, granted }
    }

    fn handle_append(&mut self, request: AppendRequest) -> AppendResponse {
        if request.term > self.stable_state.term
            || (request.term == self.stable_state.term && self.role != Role::Follower)
        {
            self.become_follower(request.term);
        }
        let term = self.stable_state.term;
        if request.term < term {
            return AppendResponse {
                term,
                success: false,
                last_index: self.last_index(),
            };
        }
        self.reset_election_deadline();
        self.set_leader(Some((request.leader.clone(), request.leader_addr.clone())));

        // Consistency check on the previous entry.
        if request.prev_log_index > 0 {
            let local_term = if request.prev_log_index == self.stable_state.snapshot_index {
                Some(self.stable_state.snapshot_term)
            } else {
                self.log.term_of(request.prev_log_index)
            };
            if local_term != Some(request.prev_log_term) {
                return AppendResponse {
                    term,
                    success: false,
                    last_index: self
                        .last_index()
                        .min(request.prev_log_index.saturating_sub(1)),
                };
            }
        }

        // Append new entries, truncating on conflict.
        let mut config_dirty = false;
        for entry in &request.entries {
            match self.log.term_of(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    if let Err(e) = self.log.truncate_from(entry.index) {
                        error!(error = %e, "log truncate failed");
                        return AppendResponse {
                            term,
                            success: false,
                            last_index: self.last_index(),
                        };
                    }
                    config_dirty = true;
                }
                None => {}
            }
            if entry.index == self.log.last_index() + 1
                || (self.log.last_index() == 0
                    && entry.index == self.stable_state.snapshot_index + 1)
            {
                if let Err(e) = self.log.append(std::slice::from_ref(entry)) {
                    error!(error = %e, "log append failed");
                    return AppendResponse {
                        term,
                        success: false,
                        last_index: self.last_index(),
                    };
                }
                if let Command::Configuration(change) = &entry.command {
                    self.latest_config = change.clone();
                    self.latest_config_index = entry.index;
                }
            }
        }
        if config_dirty {
            self.rescan_config();
        }

        if request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(self.last_index());
            self.apply_committed();
        }
        AppendResponse {
            term,
            success: true,
            last_index: self.last_index(),
        }
    }

    fn handle_install(&mut self, request: InstallSnapshotRequest) -> InstallSnapshotResponse {
        if request.term > self.stable_state.term {
            self.become_follower(request.term);
        }
        let term = self.stable_state.term;
        if request.term < term {
            return InstallSnapshotResponse { term };
        }
        self.reset_election_deadline();
        self.set_leader(Some((request.leader.clone(), request.leader_addr.clone())));

        if let Err(e) = restore_snapshot(self.fsm.as_ref(), &request.data) {
            error!(error = %e, "snapshot restore failed");
            return InstallSnapshotResponse { term };
        }
        if let Err(e) = self.log.truncate_from(self.log.first_index().max(1)) {
            error!(error = %e, "log reset failed");
        }
        if let Err(e) = self
            .snapshots
            .write(request.last_term, request.last_index, request.data.clone())
        {
            warn!(error = %e, "failed to persist installed snapshot");
        }
        self.stable_state.snapshot_index = request.last_index;
        self.stable_state.snapshot_term = request.last_term;
        self.persist_stable();
        self.commit_index = request.last_index;
        self.last_applied = request.last_index;
        self.latest_config = ConfigChange {
            prev: None,
            next: request.configuration.clone(),
        };
        self.latest_config_index = request.last_index;
        self.committed_config = request.configuration;
        InstallSnapshotResponse { term }
    }

    fn rescan_config(&mut self) {
        let mut latest = ConfigChange {
            prev: None,
            next: self.committed_config.clone(),
        };
        let mut latest_index = 0;
        let first = self.log.first_index().max(1);
        for index in first..=self.log.last_index() {
            if let Some(LogEntry {
                command: Command::Configuration(change),
                ..
            }) = self.log.entry(index)
            {
                latest = change;
                latest_index = index;
            }
        }
        self.latest_config = latest;
        self.latest_config_index = latest_index;
    }

    // ========================================================================
    // API calls
    // ========================================================================

    /// Handle one API call. Returns true when the replica should stop.
    fn handle_api(&mut self, call: ApiCall) -> bool {
        match call {
            ApiCall::Propose { command, reply } => {
                if self.role != Role::Leader {
                    let _ = reply.send(Err(RaftError::NotLeader {
                        leader: self.leader_addr(),
                    }));
                    return false;
                }
                match self.append_local(command) {
                    Ok(index) => {
                        self.pending.insert(index, reply);
                        self.advance_commit();
                        self.next_heartbeat = Instant::now();
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            ApiCall::Status { reply } => {
                let _ = reply.send(RaftStatus {
                    id: self.id.clone(),
                    role: self.role,
                    term: self.stable_state.term,
                    leader_id: self.leader.as_ref().map(|(id, _)| id.clone()),
                    leader_addr: self.leader_addr(),
                    configuration: self.latest_config.next.clone(),
                    last_index: self.last_index(),
                    commit_index: self.commit_index,
                    applied_index: self.last_applied,
                });
            }
            ApiCall::ChangeConfig { action, reply } => {
                if let Err(e) = self.change_config(action, reply) {
                    error!(error = %e, "configuration change failed");
                }
            }
            ApiCall::TakeSnapshot { reply } => {
                let _ = reply.send(self.take_snapshot());
            }
            ApiCall::Restore { data, reply } => {
                let result = restore_snapshot(self.fsm.as_ref(), &data)
                    .map_err(RaftError::from);
                let _ = reply.send(result);
            }
            ApiCall::Shutdown { leave, reply } => {
                if leave && self.role == Role::Leader {
                    // Best-effort: leave the configuration before stopping.
                    let mut next = self.latest_config.next.clone();
                    next.servers.retain(|s| s.id != self.id);
                    if !next.servers.is_empty() {
                        let _ = self.append_local(Command::Configuration(ConfigChange {
                            prev: Some(self.latest_config.next.clone()),
                            next,
                        }));
                        self.leader_tick();
                    }
                }
                self.shutdown = Some(reply);
                return true;
            }
        }
        false
    }

    fn change_config(
        &mut self,
        action: ConfigAction,
        reply: oneshot::Sender<Result<(), RaftError>>,
    ) -> Result<(), RaftError> {
        if self.role != Role::Leader {
            let _ = reply.send(Err(RaftError::NotLeader {
                leader: self.leader_addr(),
            }));
            return Ok(());
        }
        if self.config_waiter.is_some() || self.latest_config.prev.is_some() {
            let _ = reply.send(Err(RaftError::ConfigurationPending));
            return Ok(());
        }
        let current = self.latest_config.next.clone();
        let mut next = current.clone();
        match action {
            ConfigAction::Add { id, addr, suffrage } => {
                match next.servers.iter_mut().find(|s| s.id == id) {
                    Some(server) => {
                        server.addr = addr;
                        server.suffrage = suffrage;
                    }
                    None => next.servers.push(Server { id, addr, suffrage }),
                }
            }
            ConfigAction::Remove { id } => {
                next.servers.retain(|s| s.id != id);
            }
        }
        if next == current {
            let _ = reply.send(Ok(()));
            return Ok(());
        }
        let index = self.append_local(Command::Configuration(ConfigChange {
            prev: Some(current),
            next,
        }))?;
        debug!(index, "joint configuration appended");
        self.config_waiter = Some(reply);
        self.advance_commit();
        self.next_heartbeat = Instant::now();
        Ok(())
    }

    fn append_local(&mut self, command: Command) -> Result<u64, RaftError> {
        let index = self.last_index() + 1;
        let entry = LogEntry {
            term: self.stable_state.term,
            index,
            command,
        };
        self.log.append(std::slice::from_ref(&entry))?;
        if let Command::Configuration(change) = &entry.command {
            self.latest_config = change.clone();
            self.latest_config_index = index;
        }
        Ok(index)
    }

    fn last_index(&self) -> u64 {
        self.log.last_index().max(self.stable_state.snapshot_index)
    }

    fn last_term(&self) -> u64 {
        if self.log.last_index() > 0 {
            self.log.last_term()
        } else {
            self.stable_state.snapshot_term
        }
    }
}
