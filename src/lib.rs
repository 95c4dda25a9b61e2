//! weft: Woven Encrypted Overlay Networks
//!
//! A control plane for encrypted overlay meshes: a raft-replicated
//! mesh-state store, address and identity leasing, a pure topology resolver
//! that turns the membership graph into per-node tunnel peerings, and a
//! reconciler that programs them onto tunnel, firewall, and DNS drivers,
//! negotiating relayed transports where NAT blocks the direct path.

pub mod allocator;
pub mod config;
pub mod drivers;
pub mod membership;
pub mod meshdb;
pub mod negotiate;
pub mod netman;
pub mod node;
pub mod raft;
pub mod storage;
pub mod topology;

// Re-export config types
pub use config::{Config, ConfigError};

// Re-export storage types
pub use storage::{KvBackend, MemoryStore, SharedStore, StorageError, StoreEvent};

// Re-export replicated-log types
pub use raft::{
    Applied, Command, Configuration, Observation, Raft, RaftError, RaftOptions, RaftStatus, Role,
    Server, Suffrage,
};

// Re-export mesh-state types
pub use meshdb::{
    Acl, AclAction, Edge, Feature, FeaturePort, Group, Lease, MeshDb, MeshDbError, MeshNode,
    MeshState, Proposer, RoleBinding, Route, Subject, SubjectKind,
};

// Re-export allocator types
pub use allocator::{Allocator, AllocatorError, BootstrapOptions};

// Re-export membership types
pub use membership::{
    Caller, JoinRequest, JoinResponse, JoinRpc, LeaveRequest, MembershipError, MembershipOptions,
    MembershipService, WatchEvent,
};

// Re-export topology types
pub use topology::{resolve, PeerDescriptor};

// Re-export negotiator types
pub use negotiate::{
    DataChannelRpc, DataChannelSession, LocalCidrDetector, NegotiateError, NegotiateOptions,
    Negotiator, StaticCidrs,
};

// Re-export network-manager types
pub use netman::{peers_equal, NetManError, NetManOptions, NetworkManager};

// Re-export driver interfaces
pub use drivers::{
    AddressFamily, DnsDriver, DriverError, FirewallDriver, IdentityPlugin, IpamDriver,
    TunnelDevice, TunnelPeer,
};

// Re-export node types
pub use node::{Drivers, Node, NodeError, TunnelKey};
