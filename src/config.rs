//! weft Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./weft.yaml` (current directory - highest priority)
//! 2. `~/.weft.yaml` (home directory, legacy location)
//! 3. `~/.config/weft/weft.yaml` (user config directory)
//! 4. `/etc/weft/weft.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files. Durations are humane strings (`"3s"`, `"3m"`, `"150ms"`).

use crate::allocator::BootstrapOptions;
use crate::meshdb::AclAction;
use crate::negotiate::NegotiateOptions;
use crate::raft::RaftOptions;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "weft.yaml";

/// Default mesh DNS domain.
const DEFAULT_MESH_DOMAIN: &str = "weft.internal.";

/// Default IPv4 supernet.
const DEFAULT_IPV4_NETWORK: &str = "172.16.0.0/12";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid duration {value:?} for {key}")]
    ParseDuration { key: &'static str, value: String },

    #[error("invalid CIDR {value:?}: {source}")]
    ParseCidr {
        value: String,
        source: ipnet::AddrParseError,
    },

    #[error("node-id is required")]
    MissingNodeId,
}

/// Bootstrap configuration (`bootstrap.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootstrapConfig {
    /// Bootstrap a new mesh instead of joining one (`bootstrap.enabled`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enabled: bool,

    /// IPv4 supernet (`bootstrap.ipv4-network`). Defaults to 172.16.0.0/12.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_network: Option<Ipv4Net>,

    /// IPv6 supernet (`bootstrap.ipv6-network`). A ULA /48 is generated
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_network: Option<Ipv6Net>,

    /// Mesh DNS domain (`bootstrap.mesh-domain`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_domain: Option<String>,

    /// Node granted the admin role binding (`bootstrap.admin-node-id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_node_id: Option<String>,

    /// Initial voting members (`bootstrap.initial-voter-ids`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_voter_ids: Vec<String>,

    /// Default network policy, `accept` or `deny`
    /// (`bootstrap.default-network-policy`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_network_policy: Option<AclAction>,

    /// Skip RBAC entirely (`bootstrap.disable-rbac`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_rbac: bool,

    /// Re-run bootstrap against existing state (`bootstrap.force`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

impl BootstrapConfig {
    /// Translate into allocator bootstrap options.
    pub fn options(&self) -> BootstrapOptions {
        BootstrapOptions {
            ipv4_network: self
                .ipv4_network
                .unwrap_or_else(|| DEFAULT_IPV4_NETWORK.parse().expect("valid default supernet")),
            ipv6_network: self.ipv6_network,
            domain: self
                .mesh_domain
                .clone()
                .unwrap_or_else(|| DEFAULT_MESH_DOMAIN.to_string()),
            default_policy: self.default_network_policy.unwrap_or(AclAction::Accept),
            admin_node_id: self.admin_node_id.clone(),
            disable_rbac: self.disable_rbac,
            force: self.force,
        }
    }
}

/// Mesh membership configuration (`mesh.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MeshConfig {
    /// This node's unique id (`mesh.node-id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Zone awareness tag (`mesh.zone-awareness-id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_awareness_id: Option<String>,

    /// Membership endpoint to join through (`mesh.join-address`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_address: Option<String>,

    /// Join attempts before giving up (`mesh.max-join-retries`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_join_retries: Option<u32>,

    /// Request voter suffrage on join (`mesh.join-as-voter`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub join_as_voter: bool,

    /// Request observer suffrage on join (`mesh.join-as-observer`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub join_as_observer: bool,

    /// Advertised control port (`mesh.grpc-advertise-port`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_advertise_port: Option<u16>,

    /// Publicly reachable endpoint (`mesh.primary-endpoint`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_endpoint: Option<String>,

    /// Routes to advertise, as CIDRs (`mesh.routes`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,

    /// Nodes to request direct edges to (`mesh.direct-peers`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub direct_peers: Vec<String>,

    /// Disable IPv4 leasing (`mesh.no-ipv4`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_ipv4: bool,

    /// Disable IPv6 leasing (`mesh.no-ipv6`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_ipv6: bool,
}

impl MeshConfig {
    pub fn max_join_retries(&self) -> u32 {
        self.max_join_retries.unwrap_or(10)
    }

    pub fn grpc_advertise_port(&self) -> u16 {
        self.grpc_advertise_port.unwrap_or(8443)
    }

    /// Parse the configured route CIDRs.
    pub fn parsed_routes(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.routes
            .iter()
            .map(|raw| {
                raw.parse().map_err(|source| ConfigError::ParseCidr {
                    value: raw.clone(),
                    source,
                })
            })
            .collect()
    }
}

/// Replicated log configuration (`raft.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RaftConfig {
    /// Listen address (`raft.listen-address`). Defaults to `[::]:9443`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,

    /// Durable state directory (`raft.data-dir`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Keep everything in memory (`raft.in-memory`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub in_memory: bool,

    /// Pooled connections per peer (`raft.connection-pool-count`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_pool_count: Option<usize>,

    /// Dial timeout (`raft.connection-timeout`). Defaults to 3s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<String>,

    /// Heartbeat timeout (`raft.heartbeat-timeout`). Defaults to 3s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<String>,

    /// Election timeout (`raft.election-timeout`). Defaults to 3s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub election_timeout: Option<String>,

    /// Apply timeout (`raft.apply-timeout`). Defaults to 15s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_timeout: Option<String>,

    /// Commit timeout (`raft.commit-timeout`). Defaults to 15s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timeout: Option<String>,

    /// Entries per append batch (`raft.max-append-entries`). Defaults to 15.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_append_entries: Option<usize>,

    /// Leader lease timeout (`raft.leader-lease-timeout`). Defaults to 3s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_lease_timeout: Option<String>,

    /// Periodic snapshot interval (`raft.snapshot-interval`). Defaults to 3m.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_interval: Option<String>,

    /// Entries between threshold snapshots (`raft.snapshot-threshold`).
    /// Defaults to 5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_threshold: Option<usize>,

    /// Snapshots retained on disk (`raft.snapshot-retention`). Defaults to 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_retention: Option<usize>,

    /// Observer channel buffer (`raft.observer-chan-buffer`). Defaults to
    /// 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer_chan_buffer: Option<usize>,

    /// Prefer IPv6 advertise addresses (`raft.prefer-ipv6`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prefer_ipv6: bool,

    /// Remove self from the configuration on shutdown
    /// (`raft.leave-on-shutdown`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub leave_on_shutdown: bool,

    /// Consecutive misses before a silent non-voter is evicted
    /// (`raft.heartbeat-failure-threshold`). Defaults to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_failure_threshold: Option<u32>,
}

impl RaftConfig {
    /// Translate into replica options.
    pub fn options(&self) -> Result<RaftOptions, ConfigError> {
        let defaults = RaftOptions::default();
        Ok(RaftOptions {
            listen_address: self
                .listen_address
                .clone()
                .unwrap_or(defaults.listen_address),
            data_dir: self.data_dir.clone().unwrap_or(defaults.data_dir),
            in_memory: self.in_memory,
            connection_pool_count: self
                .connection_pool_count
                .unwrap_or(defaults.connection_pool_count),
            connection_timeout: duration_or(
                "raft.connection-timeout",
                &self.connection_timeout,
                defaults.connection_timeout,
            )?,
            heartbeat_timeout: duration_or(
                "raft.heartbeat-timeout",
                &self.heartbeat_timeout,
                defaults.heartbeat_timeout,
            )?,
            election_timeout: duration_or(
                "raft.election-timeout",
                &self.election_timeout,
                defaults.election_timeout,
            )?,
            apply_timeout: duration_or(
                "raft.apply-timeout",
                &self.apply_timeout,
                defaults.apply_timeout,
            )?,
            commit_timeout: duration_or(
                "raft.commit-timeout",
                &self.commit_timeout,
                defaults.commit_timeout,
            )?,
            max_append_entries: self
                .max_append_entries
                .unwrap_or(defaults.max_append_entries),
            leader_lease_timeout: duration_or(
                "raft.leader-lease-timeout",
                &self.leader_lease_timeout,
                defaults.leader_lease_timeout,
            )?,
            snapshot_interval: duration_or(
                "raft.snapshot-interval",
                &self.snapshot_interval,
                defaults.snapshot_interval,
            )?,
            snapshot_threshold: self
                .snapshot_threshold
                .unwrap_or(defaults.snapshot_threshold),
            snapshot_retention: self
                .snapshot_retention
                .unwrap_or(defaults.snapshot_retention),
            observer_chan_buffer: self
                .observer_chan_buffer
                .unwrap_or(defaults.observer_chan_buffer),
            prefer_ipv6: self.prefer_ipv6,
            leave_on_shutdown: self.leave_on_shutdown,
            heartbeat_failure_threshold: self
                .heartbeat_failure_threshold
                .unwrap_or(defaults.heartbeat_failure_threshold),
        })
    }
}

/// ICE configuration (`ice.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IceConfig {
    /// Keepalive probe timeout (`ice.ping-timeout`). Defaults to 5s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_timeout: Option<String>,

    /// Bound on one negotiation dial (`ice.dial-timeout`). Defaults to 30s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_timeout: Option<String>,
}

impl IceConfig {
    /// Translate into negotiator options, taking the mesh-level fields from
    /// `mesh`.
    pub fn options(&self, mesh: &MeshConfig) -> Result<NegotiateOptions, ConfigError> {
        let defaults = NegotiateOptions::default();
        Ok(NegotiateOptions {
            zone_awareness_id: mesh.zone_awareness_id.clone().unwrap_or_default(),
            disable_ipv4: mesh.no_ipv4,
            disable_ipv6: mesh.no_ipv6,
            dial_timeout: duration_or(
                "ice.dial-timeout",
                &self.dial_timeout,
                defaults.dial_timeout,
            )?,
            ping_timeout: duration_or(
                "ice.ping-timeout",
                &self.ping_timeout,
                defaults.ping_timeout,
            )?,
        })
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Bootstrap configuration (`bootstrap.*`).
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Mesh configuration (`mesh.*`).
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Replicated log configuration (`raft.*`).
    #[serde(default)]
    pub raft: RaftConfig,

    /// ICE configuration (`ice.*`).
    #[serde(default)]
    pub ice: IceConfig,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths, lowest priority
    /// first, merging as it goes. Returns the merged config and the paths
    /// that were loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load configuration from specific paths, later paths overriding
    /// earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();
        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }
        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// The standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/weft").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("weft").join(CONFIG_FILENAME));
        }

        // Home directory (legacy location)
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".weft.yaml"));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one. Values from `other`
    /// override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        merge_opt(&mut self.bootstrap.ipv4_network, other.bootstrap.ipv4_network);
        merge_opt(&mut self.bootstrap.ipv6_network, other.bootstrap.ipv6_network);
        merge_opt(&mut self.bootstrap.mesh_domain, other.bootstrap.mesh_domain);
        merge_opt(&mut self.bootstrap.admin_node_id, other.bootstrap.admin_node_id);
        merge_opt(
            &mut self.bootstrap.default_network_policy,
            other.bootstrap.default_network_policy,
        );
        if !other.bootstrap.initial_voter_ids.is_empty() {
            self.bootstrap.initial_voter_ids = other.bootstrap.initial_voter_ids;
        }
        self.bootstrap.enabled |= other.bootstrap.enabled;
        self.bootstrap.disable_rbac |= other.bootstrap.disable_rbac;
        self.bootstrap.force |= other.bootstrap.force;

        merge_opt(&mut self.mesh.node_id, other.mesh.node_id);
        merge_opt(&mut self.mesh.zone_awareness_id, other.mesh.zone_awareness_id);
        merge_opt(&mut self.mesh.join_address, other.mesh.join_address);
        merge_opt(&mut self.mesh.max_join_retries, other.mesh.max_join_retries);
        merge_opt(&mut self.mesh.grpc_advertise_port, other.mesh.grpc_advertise_port);
        merge_opt(&mut self.mesh.primary_endpoint, other.mesh.primary_endpoint);
        if !other.mesh.routes.is_empty() {
            self.mesh.routes = other.mesh.routes;
        }
        if !other.mesh.direct_peers.is_empty() {
            self.mesh.direct_peers = other.mesh.direct_peers;
        }
        self.mesh.join_as_voter |= other.mesh.join_as_voter;
        self.mesh.join_as_observer |= other.mesh.join_as_observer;
        self.mesh.no_ipv4 |= other.mesh.no_ipv4;
        self.mesh.no_ipv6 |= other.mesh.no_ipv6;

        merge_opt(&mut self.raft.listen_address, other.raft.listen_address);
        merge_opt(&mut self.raft.data_dir, other.raft.data_dir);
        merge_opt(
            &mut self.raft.connection_pool_count,
            other.raft.connection_pool_count,
        );
        merge_opt(&mut self.raft.connection_timeout, other.raft.connection_timeout);
        merge_opt(&mut self.raft.heartbeat_timeout, other.raft.heartbeat_timeout);
        merge_opt(&mut self.raft.election_timeout, other.raft.election_timeout);
        merge_opt(&mut self.raft.apply_timeout, other.raft.apply_timeout);
        merge_opt(&mut self.raft.commit_timeout, other.raft.commit_timeout);
        merge_opt(&mut self.raft.max_append_entries, other.raft.max_append_entries);
        merge_opt(
            &mut self.raft.leader_lease_timeout,
            other.raft.leader_lease_timeout,
        );
        merge_opt(&mut self.raft.snapshot_interval, other.raft.snapshot_interval);
        merge_opt(&mut self.raft.snapshot_threshold, other.raft.snapshot_threshold);
        merge_opt(&mut self.raft.snapshot_retention, other.raft.snapshot_retention);
        merge_opt(
            &mut self.raft.observer_chan_buffer,
            other.raft.observer_chan_buffer,
        );
        merge_opt(
            &mut self.raft.heartbeat_failure_threshold,
            other.raft.heartbeat_failure_threshold,
        );
        self.raft.in_memory |= other.raft.in_memory;
        self.raft.prefer_ipv6 |= other.raft.prefer_ipv6;
        self.raft.leave_on_shutdown |= other.raft.leave_on_shutdown;

        merge_opt(&mut self.ice.ping_timeout, other.ice.ping_timeout);
        merge_opt(&mut self.ice.dial_timeout, other.ice.dial_timeout);
    }

    /// The configured node id.
    pub fn node_id(&self) -> Result<String, ConfigError> {
        self.mesh
            .node_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingNodeId)
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

fn merge_opt<T>(dst: &mut Option<T>, src: Option<T>) {
    if src.is_some() {
        *dst = src;
    }
}

/// Parse a humane duration: `150ms`, `3s`, `3m`, `1h`, or bare seconds.
pub fn parse_duration(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let err = || ConfigError::ParseDuration {
        key,
        value: raw.to_string(),
    };
    let (number, unit) = match raw.find(|c: char| c.is_ascii_alphabetic()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = number.trim().parse().map_err(|_| err())?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(err()),
    }
}

fn duration_or(
    key: &'static str,
    raw: &Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match raw {
        Some(raw) => parse_duration(key, raw),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_defaults() {
        let config = Config::new();
        assert!(config.node_id().is_err());
        assert_eq!(config.mesh.max_join_retries(), 10);
        assert_eq!(config.mesh.grpc_advertise_port(), 8443);
        let raft = config.raft.options().unwrap();
        assert_eq!(raft.listen_address, "[::]:9443");
        assert_eq!(raft.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(raft.snapshot_interval, Duration::from_secs(180));
        assert_eq!(raft.snapshot_threshold, 5);
        assert_eq!(raft.heartbeat_failure_threshold, 30);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
bootstrap:
  enabled: true
  ipv4-network: "10.10.0.0/16"
  mesh-domain: "example.mesh."
  admin-node-id: "first"
  default-network-policy: deny
mesh:
  node-id: "first"
  zone-awareness-id: "dc-1"
  grpc-advertise-port: 9000
  routes:
    - "10.99.0.0/24"
raft:
  in-memory: true
  heartbeat-timeout: "500ms"
  snapshot-interval: "1m"
  heartbeat-failure-threshold: 5
ice:
  ping-timeout: "2s"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.bootstrap.enabled);
        assert_eq!(
            config.bootstrap.ipv4_network.unwrap().to_string(),
            "10.10.0.0/16"
        );
        assert_eq!(config.node_id().unwrap(), "first");
        let raft = config.raft.options().unwrap();
        assert!(raft.in_memory);
        assert_eq!(raft.heartbeat_timeout, Duration::from_millis(500));
        assert_eq!(raft.snapshot_interval, Duration::from_secs(60));
        assert_eq!(raft.heartbeat_failure_threshold, 5);
        let ice = config.ice.options(&config.mesh).unwrap();
        assert_eq!(ice.ping_timeout, Duration::from_secs(2));
        assert_eq!(ice.zone_awareness_id, "dc-1");
        assert_eq!(config.mesh.parsed_routes().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(
            parse_duration("k", "150ms").unwrap(),
            Duration::from_millis(150)
        );
        assert_eq!(parse_duration("k", "3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("k", "3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("k", "1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("k", "42").unwrap(), Duration::from_secs(42));
        assert!(parse_duration("k", "3 fortnights").is_err());
        assert!(parse_duration("k", "fast").is_err());
    }

    #[test]
    fn test_bad_route_cidr() {
        let mut config = Config::new();
        config.mesh.routes = vec!["not-a-cidr".into()];
        assert!(matches!(
            config.mesh.parsed_routes(),
            Err(ConfigError::ParseCidr { .. })
        ));
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = Config::new();
        base.mesh.node_id = Some("base".into());
        base.raft.heartbeat_timeout = Some("3s".into());

        let mut over = Config::new();
        over.mesh.node_id = Some("override".into());
        over.raft.in_memory = true;

        base.merge(over);
        assert_eq!(base.node_id().unwrap(), "override");
        assert!(base.raft.in_memory);
        // Untouched values survive the merge.
        assert_eq!(base.raft.heartbeat_timeout.as_deref(), Some("3s"));
    }

    #[test]
    fn test_load_from_paths_merges() {
        let temp_dir = TempDir::new().unwrap();
        let low = temp_dir.path().join("low.yaml");
        let high = temp_dir.path().join("high.yaml");
        fs::write(&low, "mesh:\n  node-id: \"low\"\n  zone-awareness-id: \"z\"\n").unwrap();
        fs::write(&high, "mesh:\n  node-id: \"high\"\n").unwrap();

        let paths = vec![low.clone(), high.clone()];
        let (config, loaded) = Config::load_from_paths(&paths).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(config.node_id().unwrap(), "high");
        assert_eq!(config.mesh.zone_awareness_id.as_deref(), Some("z"));
    }

    #[test]
    fn test_load_skips_missing_files() {
        let temp_dir = TempDir::new().unwrap();
        let existing = temp_dir.path().join("exists.yaml");
        fs::write(&existing, "mesh:\n  node-id: \"present\"\n").unwrap();
        let missing = temp_dir.path().join("missing.yaml");

        let (config, loaded) = Config::load_from_paths(&[missing, existing.clone()]).unwrap();
        assert_eq!(loaded, vec![existing]);
        assert_eq!(config.node_id().unwrap(), "present");
    }

    #[test]
    fn test_to_yaml_omits_defaults() {
        let config = Config::new();
        let yaml = config.to_yaml().unwrap();
        assert!(!yaml.contains("node-id"));
        assert!(!yaml.contains("in-memory"));
    }
}
