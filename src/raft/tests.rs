use super::log::{Command, MemoryLogStore, MemoryStableStore};
use super::transport::MemoryNetwork;
use super::*;
use crate::storage::{KvBackend, MemoryStore, SharedStore};
use std::sync::Arc;
use std::time::Duration;

struct TestNode {
    raft: Raft,
    store: SharedStore,
}

fn fast_options() -> RaftOptions {
    RaftOptions {
        in_memory: true,
        heartbeat_timeout: Duration::from_millis(150),
        election_timeout: Duration::from_millis(150),
        leader_lease_timeout: Duration::from_millis(600),
        apply_timeout: Duration::from_secs(5),
        commit_timeout: Duration::from_secs(5),
        snapshot_threshold: 1000,
        ..Default::default()
    }
}

fn start_node(
    network: &Arc<MemoryNetwork>,
    id: &str,
    bootstrap: Option<Configuration>,
) -> TestNode {
    let addr = format!("{id}-addr");
    let (transport, inbound) = network.join(&addr);
    let store: SharedStore = Arc::new(MemoryStore::new());
    let raft = Raft::start_with(
        id,
        addr,
        fast_options(),
        Arc::clone(&store),
        Box::new(MemoryLogStore::new()),
        Box::new(MemoryStableStore::new()),
        transport,
        inbound,
        bootstrap,
    )
    .unwrap();
    TestNode { raft, store }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_leader(node: &TestNode) {
    wait_for("leadership", || async { node.raft.is_leader().await }).await;
}

#[tokio::test]
async fn test_single_node_elects_and_applies() {
    let network = MemoryNetwork::new();
    let node = start_node(&network, "n1", Some(Configuration::single("n1", "n1-addr")));
    wait_leader(&node).await;

    let applied = node
        .raft
        .propose(Command::put("/registry/nodes/a", "{}"))
        .await
        .unwrap();
    assert!(applied.index > 0);
    assert_eq!(
        node.store.get("/registry/nodes/a").unwrap().as_deref(),
        Some("{}")
    );

    let barrier_index = node.raft.barrier(Duration::from_secs(5)).await.unwrap();
    assert!(barrier_index > applied.index);
}

#[tokio::test]
async fn test_propose_without_leadership_fails() {
    let network = MemoryNetwork::new();
    // No bootstrap configuration: the node idles as a follower.
    let node = start_node(&network, "lonely", None);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let err = node.raft.propose(Command::Noop).await.unwrap_err();
    assert!(matches!(err, RaftError::NotLeader { .. }));
}

#[tokio::test]
async fn test_replication_reaches_voters() {
    let network = MemoryNetwork::new();
    let n1 = start_node(&network, "n1", Some(Configuration::single("n1", "n1-addr")));
    wait_leader(&n1).await;
    let n2 = start_node(&network, "n2", None);
    let n3 = start_node(&network, "n3", None);
    n1.raft.add_voter("n2", "n2-addr").await.unwrap();
    n1.raft.add_voter("n3", "n3-addr").await.unwrap();

    n1.raft
        .propose(Command::put("/k", "v"))
        .await
        .unwrap();
    wait_for("replication to n2", || async {
        n2.store.get("/k").unwrap().as_deref() == Some("v")
    })
    .await;
    wait_for("replication to n3", || async {
        n3.store.get("/k").unwrap().as_deref() == Some("v")
    })
    .await;

    let config = n1.raft.configuration().await.unwrap();
    assert_eq!(config.servers.len(), 3);
    assert!(config
        .servers
        .iter()
        .all(|s| s.suffrage == Suffrage::Voter));
}

#[tokio::test]
async fn test_leader_failover() {
    let network = MemoryNetwork::new();
    let n1 = start_node(&network, "n1", Some(Configuration::single("n1", "n1-addr")));
    wait_leader(&n1).await;
    let n2 = start_node(&network, "n2", None);
    let n3 = start_node(&network, "n3", None);
    n1.raft.add_voter("n2", "n2-addr").await.unwrap();
    n1.raft.add_voter("n3", "n3-addr").await.unwrap();
    n1.raft.propose(Command::put("/k", "1")).await.unwrap();

    // Cut the leader off; the remaining majority elects a successor.
    network.partition("n1-addr");
    wait_for("new leader", || async {
        n2.raft.is_leader().await || n3.raft.is_leader().await
    })
    .await;
    let successor = if n2.raft.is_leader().await { &n2 } else { &n3 };
    successor
        .raft
        .propose(Command::put("/k", "2"))
        .await
        .unwrap();
    assert_eq!(successor.store.get("/k").unwrap().as_deref(), Some("2"));
}

#[tokio::test]
async fn test_observers_do_not_count_toward_quorum() {
    let network = MemoryNetwork::new();
    let n1 = start_node(&network, "n1", Some(Configuration::single("n1", "n1-addr")));
    wait_leader(&n1).await;
    let n2 = start_node(&network, "n2", None);
    n1.raft.add_observer("n2", "n2-addr").await.unwrap();

    // Replication reaches the observer.
    n1.raft.propose(Command::put("/k", "v")).await.unwrap();
    wait_for("replication to observer", || async {
        n2.store.get("/k").unwrap().as_deref() == Some("v")
    })
    .await;

    // A dead observer does not stall commits.
    network.partition("n2-addr");
    n1.raft.propose(Command::put("/k", "v2")).await.unwrap();
    assert_eq!(n1.store.get("/k").unwrap().as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_snapshot_compacts_and_catches_up_new_follower() {
    let network = MemoryNetwork::new();
    let n1 = start_node(&network, "n1", Some(Configuration::single("n1", "n1-addr")));
    wait_leader(&n1).await;
    for i in 0..20 {
        n1.raft
            .propose(Command::put(format!("/k/{i}"), i.to_string()))
            .await
            .unwrap();
    }
    let covered = n1.raft.snapshot().await.unwrap();
    assert!(covered >= 20);

    // A follower joining after compaction is restored from the snapshot.
    let n2 = start_node(&network, "n2", None);
    n1.raft.add_voter("n2", "n2-addr").await.unwrap();
    wait_for("snapshot catch-up", || async {
        n2.store.get("/k/19").unwrap().as_deref() == Some("19")
    })
    .await;
    assert_eq!(n2.store.dump().unwrap().len(), n1.store.dump().unwrap().len());
}

#[tokio::test]
async fn test_concurrent_configuration_changes_rejected() {
    let network = MemoryNetwork::new();
    let n1 = start_node(&network, "n1", Some(Configuration::single("n1", "n1-addr")));
    wait_leader(&n1).await;

    // "n9" is unreachable, so the joint phase cannot complete; a second
    // change must be refused while it is pending.
    let raft = n1.raft.clone();
    let first = tokio::spawn(async move { raft.add_voter("n9", "n9-addr").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = n1.raft.add_voter("n10", "n10-addr").await.unwrap_err();
    assert!(matches!(err, RaftError::ConfigurationPending));
    first.abort();
}

#[tokio::test]
async fn test_heartbeat_failure_observations() {
    let network = MemoryNetwork::new();
    let n1 = start_node(&network, "n1", Some(Configuration::single("n1", "n1-addr")));
    wait_leader(&n1).await;
    let mut observations = n1.raft.observe();
    let n2 = start_node(&network, "n2", None);
    n1.raft.add_observer("n2", "n2-addr").await.unwrap();
    drop(n2);
    network.partition("n2-addr");

    // Consecutive failures are reported with a growing count.
    let mut highest = 0;
    for _ in 0..200 {
        match tokio::time::timeout(Duration::from_secs(1), observations.recv()).await {
            Ok(Ok(Observation::HeartbeatFailed { peer, count })) if peer == "n2" => {
                highest = highest.max(count);
                if highest >= 3 {
                    break;
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
    assert!(highest >= 3, "expected at least 3 consecutive failures, saw {highest}");
}

#[tokio::test]
async fn test_observation_stream_reports_membership() {
    let network = MemoryNetwork::new();
    let n1 = start_node(&network, "n1", Some(Configuration::single("n1", "n1-addr")));
    wait_leader(&n1).await;
    let mut observations = n1.raft.observe();
    let _n2 = start_node(&network, "n2", None);
    n1.raft.add_observer("n2", "n2-addr").await.unwrap();

    let mut saw_added = false;
    for _ in 0..50 {
        match tokio::time::timeout(Duration::from_secs(1), observations.recv()).await {
            Ok(Ok(Observation::PeerAdded { id, suffrage })) if id == "n2" => {
                assert_eq!(suffrage, Suffrage::NonVoter);
                saw_added = true;
                break;
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_added, "expected a PeerAdded observation for n2");
}

#[tokio::test]
async fn test_durable_stores_survive_restart() {
    use super::log::{FileLogStore, FileStableStore, LogStore, StableStore};
    let dir = tempfile::TempDir::new().unwrap();
    let log_path = dir.path().join("log.bin");
    let stable_path = dir.path().join("stable.json");
    {
        let mut log = FileLogStore::open(&log_path).unwrap();
        log.append(&[super::log::LogEntry {
            term: 1,
            index: 1,
            command: Command::put("/a", "1"),
        }])
        .unwrap();
        let mut stable = FileStableStore::open(&stable_path);
        stable
            .save(&super::log::StableState {
                term: 1,
                voted_for: Some("n1".into()),
                snapshot_index: 0,
                snapshot_term: 0,
            })
            .unwrap();
    }
    let log = FileLogStore::open(&log_path).unwrap();
    assert_eq!(log.last_index(), 1);
    let stable = FileStableStore::open(&stable_path);
    assert_eq!(stable.load().unwrap().term, 1);
}
