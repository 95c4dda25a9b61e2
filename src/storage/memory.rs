//! In-Memory Storage Backend
//!
//! `BTreeMap`-backed implementation of [`KvBackend`]. Lexicographic key order
//! makes prefix scans a range query. Subscribers receive every mutation under
//! their prefix in the order the mutations were applied.

use super::{EventRx, KvBackend, StorageError, StoreEvent, SubscriptionId};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

struct Subscriber {
    id: SubscriptionId,
    prefix: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

/// In-memory key-value store.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, String>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_sub: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, event: StoreEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        // Drop subscribers whose receiver side has gone away.
        subs.retain(|sub| {
            if !event.key.starts_with(&sub.prefix) {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }
}

impl KvBackend for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            data.insert(key.to_string(), value.to_string());
        }
        trace!(key, "store put");
        self.notify(StoreEvent {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let existed = {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            data.remove(key).is_some()
        };
        if existed {
            trace!(key, "store delete");
            self.notify(StoreEvent {
                key: key.to_string(),
                value: None,
            });
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(range_for(&data, prefix).map(|(k, _)| k.clone()).collect())
    }

    fn iter_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &str) -> bool,
    ) -> Result<(), StorageError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        for (k, v) in range_for(&data, prefix) {
            if !visit(k, v) {
                break;
            }
        }
        Ok(())
    }

    fn dump(&self) -> Result<Vec<(String, String)>, StorageError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn restore(&self, entries: Vec<(String, String)>) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.clear();
        for (k, v) in entries {
            data.insert(k, v);
        }
        Ok(())
    }

    fn subscribe(&self, prefix: &str) -> (SubscriptionId, EventRx) {
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.push(Subscriber {
            id,
            prefix: prefix.to_string(),
            tx,
        });
        (id, rx)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|sub| sub.id != id);
    }
}

fn range_for<'a>(
    data: &'a BTreeMap<String, String>,
    prefix: &str,
) -> impl Iterator<Item = (&'a String, &'a String)> + 'a {
    let prefix = prefix.to_string();
    data.range::<String, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("/registry/nodes/a", "1").unwrap();
        assert_eq!(store.get("/registry/nodes/a").unwrap().as_deref(), Some("1"));
        store.delete("/registry/nodes/a").unwrap();
        assert_eq!(store.get("/registry/nodes/a").unwrap(), None);
    }

    #[test]
    fn test_empty_key_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.put("", "x"),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_list_prefix_ordered() {
        let store = MemoryStore::new();
        store.put("/registry/nodes/b", "2").unwrap();
        store.put("/registry/nodes/a", "1").unwrap();
        store.put("/registry/edges/a:b", "e").unwrap();
        let keys = store.list("/registry/nodes/").unwrap();
        assert_eq!(keys, vec!["/registry/nodes/a", "/registry/nodes/b"]);
    }

    #[test]
    fn test_iter_prefix_stops_early() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.put(&format!("/k/{i}"), "v").unwrap();
        }
        let mut seen = 0;
        store
            .iter_prefix("/k/", &mut |_, _| {
                seen += 1;
                seen < 2
            })
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_dump_restore_round_trip() {
        let store = MemoryStore::new();
        store.put("/a", "1").unwrap();
        store.put("/b", "2").unwrap();
        let dump = store.dump().unwrap();

        let other = MemoryStore::new();
        other.put("/stale", "x").unwrap();
        other.restore(dump).unwrap();
        assert_eq!(other.get("/stale").unwrap(), None);
        assert_eq!(other.get("/a").unwrap().as_deref(), Some("1"));
        assert_eq!(other.get("/b").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_subscribe_prefix_filtered() {
        let store = MemoryStore::new();
        let (_id, mut rx) = store.subscribe("/registry/nodes/");
        store.put("/registry/nodes/a", "1").unwrap();
        store.put("/registry/edges/a:b", "e").unwrap();
        store.delete("/registry/nodes/a").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.key, "/registry/nodes/a");
        assert_eq!(first.value.as_deref(), Some("1"));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.value, None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let store = MemoryStore::new();
        let (id, mut rx) = store.subscribe("/");
        store.unsubscribe(id);
        store.put("/a", "1").unwrap();
        assert!(rx.try_recv().is_err());
    }
}
