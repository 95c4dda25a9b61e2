//! Mesh-State Storage Backend
//!
//! Prefix-scoped key-value storage underneath the replicated log. Keys are
//! UTF-8 paths (`/registry/nodes/<id>`), values are opaque strings (the typed
//! views in [`crate::meshdb`] store JSON documents). The backend is swappable;
//! the in-memory implementation in [`memory`] is the default and is also what
//! snapshots restore into.
//!
//! All mutations flow through the replicated log's state machine. Components
//! other than the log hold read views plus change subscriptions.

pub mod memory;

pub use self::memory::MemoryStore;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend closed")]
    Closed,

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifier for a registered prefix subscription.
pub type SubscriptionId = u64;

/// A single change observed on the store.
///
/// `value` is `None` when the key was deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: String,
    pub value: Option<String>,
}

/// Channel receiver for store change events.
pub type EventRx = mpsc::UnboundedReceiver<StoreEvent>;

/// Key-value storage backend.
///
/// Implementations must be safe for concurrent readers; writes are serialized
/// by the replicated log before they reach the backend, so internal locking
/// only needs to protect against readers racing a write.
pub trait KvBackend: Send + Sync + 'static {
    /// Get the value stored at `key`.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` at `key`, replacing any existing value.
    fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete `key`. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys beginning with `prefix`, in lexicographic order.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Visit every `(key, value)` pair under `prefix` in lexicographic order.
    /// The visitor returns `false` to stop early.
    fn iter_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &str) -> bool,
    ) -> Result<(), StorageError>;

    /// Dump the entire store in lexicographic key order. Snapshot input.
    fn dump(&self) -> Result<Vec<(String, String)>, StorageError>;

    /// Replace the entire store contents in one transaction. Snapshot restore.
    fn restore(&self, entries: Vec<(String, String)>) -> Result<(), StorageError>;

    /// Subscribe to changes under `prefix`. Events are delivered in mutation
    /// order. The subscription stays live until [`KvBackend::unsubscribe`].
    fn subscribe(&self, prefix: &str) -> (SubscriptionId, EventRx);

    /// Cancel a prefix subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Shared handle to a storage backend.
pub type SharedStore = Arc<dyn KvBackend>;
