//! Log Entries and Log Storage
//!
//! Commands are opaque-to-the-log mutations of the key-value store; the state
//! machine is a deterministic replay of committed commands. Two log store
//! implementations: in-memory for tests and `in-memory` mode, and an
//! append-only file of length-prefixed JSON records for durable mode.

use crate::storage::{KvBackend, StorageError};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{Configuration, Suffrage};

/// A replicated command.
///
/// `Noop` carries no state-machine effect but commits like any other entry;
/// barriers are built on it. `Configuration` entries change cluster
/// membership and are interpreted by the replica, not the state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Put { key: String, value: String },
    Delete { key: String },
    Batch { commands: Vec<Command> },
    Noop,
    Configuration(ConfigChange),
}

/// A membership change entry.
///
/// The two-phase joint form carries `prev`: while a joint entry is the latest
/// configuration, quorums must be satisfied in both `prev` and `next`. Once
/// the joint entry commits, the leader appends the final entry (`prev:
/// None`) to leave the joint phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub prev: Option<Configuration>,
    pub next: Configuration,
}

impl Command {
    /// Convenience constructor for a single-key write.
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Convenience constructor for a single-key delete.
    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }
}

/// Apply a committed command to the state machine.
///
/// Deterministic: the same command sequence on the same starting store yields
/// the same contents on every replica.
pub fn apply_command(store: &dyn KvBackend, command: &Command) -> Result<(), StorageError> {
    match command {
        Command::Put { key, value } => store.put(key, value),
        Command::Delete { key } => store.delete(key),
        Command::Batch { commands } => {
            for cmd in commands {
                apply_command(store, cmd)?;
            }
            Ok(())
        }
        Command::Noop | Command::Configuration(_) => Ok(()),
    }
}

/// A single log record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

/// Log storage. Indexes are 1-based; 0 means "nothing".
///
/// After compaction the store may not start at index 1; `first_index`
/// reflects the earliest retained entry.
pub trait LogStore: Send {
    /// Index of the earliest retained entry, 0 when empty.
    fn first_index(&self) -> u64;

    /// Index of the latest entry, 0 when empty.
    fn last_index(&self) -> u64;

    /// Term of the latest entry, 0 when empty.
    fn last_term(&self) -> u64;

    /// Term of the entry at `index`, if retained.
    fn term_of(&self, index: u64) -> Option<u64>;

    /// The entry at `index`, if retained.
    fn entry(&self, index: u64) -> Option<LogEntry>;

    /// Up to `max` entries starting at `from` (inclusive).
    fn entries(&self, from: u64, max: usize) -> Vec<LogEntry>;

    /// Append entries after the current tail. Entries must be contiguous.
    fn append(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// Drop every entry at `index` and beyond (conflict resolution).
    fn truncate_from(&mut self, index: u64) -> io::Result<()>;

    /// Drop every entry up to and including `index` (snapshot compaction).
    fn compact_to(&mut self, index: u64) -> io::Result<()>;
}

/// Volatile log store.
#[derive(Default)]
pub struct MemoryLogStore {
    entries: Vec<LogEntry>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn first_index(&self) -> u64 {
        self.entries.first().map(|e| e.index).unwrap_or(0)
    }

    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_of(&self, index: u64) -> Option<u64> {
        self.entry(index).map(|e| e.term)
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        let first = self.first_index();
        if first == 0 || index < first {
            return None;
        }
        self.entries.get((index - first) as usize).cloned()
    }

    fn entries(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let first = self.first_index();
        if first == 0 || from > self.last_index() {
            return Vec::new();
        }
        let from = from.max(first);
        let start = (from - first) as usize;
        self.entries[start..].iter().take(max).cloned().collect()
    }

    fn append(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        let first = self.first_index();
        if first == 0 || index > self.last_index() {
            return Ok(());
        }
        let keep = index.saturating_sub(first) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    fn compact_to(&mut self, index: u64) -> io::Result<()> {
        let first = self.first_index();
        if first == 0 || index < first {
            return Ok(());
        }
        let drop = ((index - first) as usize + 1).min(self.entries.len());
        self.entries.drain(..drop);
        Ok(())
    }
}

/// Durable log store: an append-only file of `[len: u32 LE][json]` records.
///
/// The whole log is cached in memory; truncation and compaction rewrite the
/// file. Mesh-control logs are compacted every few entries, so the rewrite
/// stays small.
pub struct FileLogStore {
    path: PathBuf,
    inner: MemoryLogStore,
}

impl FileLogStore {
    /// Open or create the log file at `path`, loading all retained entries.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = MemoryLogStore::new();
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut entries = Vec::new();
            loop {
                let mut len_buf = [0u8; 4];
                match reader.read_exact(&mut len_buf) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e),
                }
                let len = u32::from_le_bytes(len_buf) as usize;
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf)?;
                let entry: LogEntry = serde_json::from_slice(&buf)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                entries.push(entry);
            }
            inner.append(&entries)?;
        }
        Ok(Self { path, inner })
    }

    fn append_to_file(&self, entries: &[LogEntry]) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            let buf = serde_json::to_vec(entry)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writer.write_all(&(buf.len() as u32).to_le_bytes())?;
            writer.write_all(&buf)?;
        }
        writer.flush()?;
        writer.into_inner()?.sync_data()?;
        Ok(())
    }

    fn rewrite_file(&self) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        let mut writer = BufWriter::new(file);
        for entry in &self.inner.entries {
            let buf = serde_json::to_vec(entry)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writer.write_all(&(buf.len() as u32).to_le_bytes())?;
            writer.write_all(&buf)?;
        }
        writer.flush()?;
        writer.into_inner()?.sync_data()?;
        Ok(())
    }
}

impl LogStore for FileLogStore {
    fn first_index(&self) -> u64 {
        self.inner.first_index()
    }

    fn last_index(&self) -> u64 {
        self.inner.last_index()
    }

    fn last_term(&self) -> u64 {
        self.inner.last_term()
    }

    fn term_of(&self, index: u64) -> Option<u64> {
        self.inner.term_of(index)
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        self.inner.entry(index)
    }

    fn entries(&self, from: u64, max: usize) -> Vec<LogEntry> {
        self.inner.entries(from, max)
    }

    fn append(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.append_to_file(entries)?;
        self.inner.append(entries)
    }

    fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        self.inner.truncate_from(index)?;
        self.rewrite_file()
    }

    fn compact_to(&mut self, index: u64) -> io::Result<()> {
        self.inner.compact_to(index)?;
        self.rewrite_file()
    }
}

/// Durable term/vote/snapshot-position state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableState {
    pub term: u64,
    pub voted_for: Option<String>,
    /// Index covered by the latest local snapshot (0 = none).
    pub snapshot_index: u64,
    /// Term at `snapshot_index`.
    pub snapshot_term: u64,
}

/// Stable store for election and snapshot metadata.
pub trait StableStore: Send {
    fn load(&self) -> io::Result<StableState>;
    fn save(&mut self, state: &StableState) -> io::Result<()>;
}

/// Volatile stable store.
#[derive(Default)]
pub struct MemoryStableStore {
    state: StableState,
}

impl MemoryStableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StableStore for MemoryStableStore {
    fn load(&self) -> io::Result<StableState> {
        Ok(self.state.clone())
    }

    fn save(&mut self, state: &StableState) -> io::Result<()> {
        self.state = state.clone();
        Ok(())
    }
}

/// JSON-file stable store.
pub struct FileStableStore {
    path: PathBuf,
}

impl FileStableStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl StableStore for FileStableStore {
    fn load(&self) -> io::Result<StableState> {
        if !self.path.exists() {
            return Ok(StableState::default());
        }
        let data = std::fs::read(&self.path)?;
        serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn save(&mut self, state: &StableState) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)
    }
}

/// Helper: the configuration a `ConfigChange` enforces for quorum purposes.
pub fn quorum_configs(change: &ConfigChange) -> Vec<&Configuration> {
    match &change.prev {
        Some(prev) => vec![prev, &change.next],
        None => vec![&change.next],
    }
}

/// Helper: whether `id` is a voter in `config`.
pub fn is_voter(config: &Configuration, id: &str) -> bool {
    config
        .servers
        .iter()
        .any(|s| s.id == id && s.suffrage == Suffrage::Voter)
}
