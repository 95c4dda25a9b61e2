//! State-Machine Snapshots
//!
//! A snapshot is a gzip-compressed, self-describing record set: one table per
//! registry prefix, records in insertion (key) order. Restoration drops all
//! tables and reinserts in the same order within a single storage
//! transaction. Unknown tables are skipped with a warning so newer snapshots
//! restore on older nodes.

use crate::meshdb::keys;
use crate::storage::{KvBackend, StorageError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Known tables, in restore order. The catch-all `kv` table collects keys
/// outside every registry prefix.
const TABLES: &[(&str, &str)] = &[
    ("meshstate", keys::MESH_STATE),
    ("nodes", keys::NODES_PREFIX),
    ("leases", keys::LEASES_PREFIX),
    ("asns", keys::ASNS_PREFIX),
    ("edges", keys::EDGES_PREFIX),
    ("routes", keys::ROUTES_PREFIX),
    ("groups", keys::GROUPS_PREFIX),
    ("acls", keys::ACLS_PREFIX),
    ("rolebindings", keys::ROLE_BINDINGS_PREFIX),
];

const CATCH_ALL: &str = "kv";

/// Errors from snapshot encode/decode or the snapshot directory.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Record {
    key: String,
    value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Table {
    name: String,
    records: Vec<Record>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Model {
    tables: Vec<Table>,
}

/// Serialize the whole store into a compressed snapshot.
pub fn write_snapshot(store: &dyn KvBackend) -> Result<Vec<u8>, SnapshotError> {
    let dump = store.dump()?;
    let mut tables: Vec<Table> = TABLES
        .iter()
        .map(|(name, _)| Table {
            name: name.to_string(),
            records: Vec::new(),
        })
        .collect();
    let mut catch_all = Table {
        name: CATCH_ALL.to_string(),
        records: Vec::new(),
    };
    for (key, value) in dump {
        let record = Record {
            key: key.clone(),
            value,
        };
        match TABLES.iter().position(|(_, prefix)| key.starts_with(prefix)) {
            Some(i) => tables[i].records.push(record),
            None => catch_all.records.push(record),
        }
    }
    tables.push(catch_all);

    let model = Model { tables };
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, &model)?;
    let data = encoder.finish()?;
    debug!(bytes = data.len(), "snapshot encoded");
    Ok(data)
}

/// Restore a compressed snapshot, replacing the store contents.
pub fn restore_snapshot(store: &dyn KvBackend, data: &[u8]) -> Result<(), SnapshotError> {
    let mut decoder = GzDecoder::new(data);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    let model: Model = serde_json::from_slice(&json)?;

    let known: Vec<&str> = TABLES
        .iter()
        .map(|(name, _)| *name)
        .chain(std::iter::once(CATCH_ALL))
        .collect();
    let mut entries = Vec::new();
    for table in model.tables {
        if !known.contains(&table.name.as_str()) {
            warn!(table = %table.name, "ignoring unknown snapshot table");
            continue;
        }
        for record in table.records {
            entries.push((record.key, record.value));
        }
    }
    store.restore(entries)?;
    info!("snapshot restored");
    Ok(())
}

/// On-disk snapshot directory with retention.
pub struct SnapshotStore {
    dir: PathBuf,
    retention: usize,
}

impl SnapshotStore {
    /// Open (creating if needed) the snapshot directory.
    pub fn open(dir: impl AsRef<Path>, retention: usize) -> Result<Self, SnapshotError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retention: retention.max(1),
        })
    }

    fn file_name(term: u64, index: u64) -> String {
        format!("snapshot-{term:020}-{index:020}.snap.gz")
    }

    /// Persist snapshot `data` taken at `(term, index)` and prune old files.
    pub fn write(&self, term: u64, index: u64, data: &[u8]) -> Result<(), SnapshotError> {
        let path = self.dir.join(Self::file_name(term, index));
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &path)?;
        self.prune()?;
        Ok(())
    }

    /// The most recent snapshot as `(term, index, data)`, if any.
    pub fn latest(&self) -> Result<Option<(u64, u64, Vec<u8>)>, SnapshotError> {
        let mut names = self.list()?;
        let Some(name) = names.pop() else {
            return Ok(None);
        };
        let (term, index) = parse_name(&name).unwrap_or((0, 0));
        let data = std::fs::read(self.dir.join(&name))?;
        Ok(Some((term, index, data)))
    }

    fn list(&self) -> Result<Vec<String>, SnapshotError> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("snapshot-") && name.ends_with(".snap.gz"))
            .collect();
        names.sort();
        Ok(names)
    }

    fn prune(&self) -> Result<(), SnapshotError> {
        let names = self.list()?;
        if names.len() <= self.retention {
            return Ok(());
        }
        for name in &names[..names.len() - self.retention] {
            debug!(snapshot = %name, "pruning old snapshot");
            std::fs::remove_file(self.dir.join(name))?;
        }
        Ok(())
    }
}

fn parse_name(name: &str) -> Option<(u64, u64)> {
    let trimmed = name.strip_prefix("snapshot-")?.strip_suffix(".snap.gz")?;
    let (term, index) = trimmed.split_once('-')?;
    Some((term.parse().ok()?, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_round_trip() {
        let store = MemoryStore::new();
        store.put("/registry/nodes/a", r#"{"id":"a"}"#).unwrap();
        store.put("/registry/leases/a", r#"{"v4":null}"#).unwrap();
        store.put("/registry/meshstate", r#"{"domain":"x"}"#).unwrap();
        store.put("/unscoped", "v").unwrap();

        let data = write_snapshot(&store).unwrap();

        let restored = MemoryStore::new();
        restored.put("/stale", "gone").unwrap();
        restore_snapshot(&restored, &data).unwrap();

        assert_eq!(restored.dump().unwrap(), store.dump().unwrap());
        assert_eq!(restored.get("/stale").unwrap(), None);
    }

    #[test]
    fn test_unknown_table_ignored() {
        // A snapshot from a newer node with an extra table restores cleanly.
        let model = serde_json::json!({
            "tables": [
                {"name": "nodes", "records": [{"key": "/registry/nodes/a", "value": "{}"}]},
                {"name": "quotas", "records": [{"key": "/registry/quotas/a", "value": "{}"}]},
            ]
        });
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut encoder, &model).unwrap();
        let data = encoder.finish().unwrap();

        let store = MemoryStore::new();
        restore_snapshot(&store, &data).unwrap();
        assert!(store.get("/registry/nodes/a").unwrap().is_some());
        assert_eq!(store.get("/registry/quotas/a").unwrap(), None);
    }

    #[test]
    fn test_snapshot_store_retention() {
        let dir = TempDir::new().unwrap();
        let snaps = SnapshotStore::open(dir.path(), 2).unwrap();
        for i in 1..=4u64 {
            snaps.write(1, i, &[i as u8]).unwrap();
        }
        let (term, index, data) = snaps.latest().unwrap().unwrap();
        assert_eq!((term, index), (1, 4));
        assert_eq!(data, vec![4]);
        assert_eq!(snaps.list().unwrap().len(), 2);
    }
}
