//! Storage for the sequencer's replicated log, plus the snapshot handler
//! seam.
//!
//! The sequencer drives a raft node; this module supplies the `raft::Storage`
//! implementation behind a small trait so a durable store can replace the
//! in-memory one without touching the sequencer. Disk layout is out of scope
//! here.

use std::io::Write;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};

use crate::store::{restore_snapshot, DataStoreTxnProvider};

/// Replicated-log storage as seen by the sequencer: raft's read surface plus
/// the mutations the Ready cycle performs.
pub trait LogStore: Storage + Clone + Send + Sync + 'static {
    /// Persist new log entries. Overlapping suffixes are truncated first;
    /// a gap past the current last index is an error.
    fn append(&self, entries: &[Entry]) -> anyhow::Result<()>;
    fn set_hard_state(&self, hs: &HardState) -> anyhow::Result<()>;
    /// Advance only the commit index of the hard state.
    fn set_commit(&self, commit: u64) -> anyhow::Result<()>;
    fn set_conf_state(&self, cs: &ConfState) -> anyhow::Result<()>;
    /// Install a snapshot received from the leader, dropping covered entries.
    fn apply_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
    /// Cut a local snapshot at `index` carrying `data`.
    fn create_snapshot(
        &self,
        index: u64,
        conf_state: Option<ConfState>,
        data: Vec<u8>,
    ) -> anyhow::Result<Snapshot>;
    /// Drop entries with index <= `up_to`.
    fn compact(&self, up_to: u64) -> anyhow::Result<()>;
    fn current_snapshot(&self) -> Snapshot;
    /// Entries with index in `[low, high)`, unbounded in size.
    fn entries_range(&self, low: u64, high: u64) -> anyhow::Result<Vec<Entry>>;
}

struct MemLogCore {
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
    /// Entries with index greater than the snapshot index, contiguous.
    entries: Vec<Entry>,
}

impl MemLogCore {
    fn first_index(&self) -> u64 {
        match self.entries.first() {
            Some(e) => e.get_index(),
            None => self.snapshot.get_metadata().get_index() + 1,
        }
    }

    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(e) => e.get_index(),
            None => self.snapshot.get_metadata().get_index(),
        }
    }
}

/// In-memory [`LogStore`].
#[derive(Clone)]
pub struct MemLogStore {
    core: Arc<RwLock<MemLogCore>>,
}

impl MemLogStore {
    /// Fresh log for a group with the given voter set.
    pub fn with_voters(voters: Vec<u64>) -> Self {
        let mut conf_state = ConfState::default();
        conf_state.set_voters(voters);
        Self {
            core: Arc::new(RwLock::new(MemLogCore {
                hard_state: HardState::default(),
                conf_state,
                snapshot: Snapshot::default(),
                entries: Vec::new(),
            })),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemLogCore> {
        self.core.read().expect("log store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemLogCore> {
        self.core.write().expect("log store lock poisoned")
    }
}

impl Storage for MemLogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.read();
        Ok(RaftState::new(
            core.hard_state.clone(),
            core.conf_state.clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.read();
        if low < core.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        if core.entries.is_empty() {
            return Ok(Vec::new());
        }
        let offset = core.entries[0].get_index();
        let mut out =
            core.entries[(low - offset) as usize..(high - offset) as usize].to_vec();
        raft::util::limit_size(&mut out, max_size.into());
        Ok(out)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.read();
        let snapshot_index = core.snapshot.get_metadata().get_index();
        if idx == snapshot_index {
            return Ok(core.snapshot.get_metadata().get_term());
        }
        if idx < core.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > core.last_index() {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        let offset = core.entries[0].get_index();
        Ok(core.entries[(idx - offset) as usize].get_term())
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.read().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.read().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.read();
        if core.snapshot.get_metadata().get_index() < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(core.snapshot.clone())
    }
}

impl LogStore for MemLogStore {
    fn append(&self, entries: &[Entry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut core = self.write();
        let first_index = core.first_index();
        let incoming_last = entries[entries.len() - 1].get_index();
        if incoming_last < first_index {
            // Everything here is already covered by the snapshot.
            return Ok(());
        }
        // Skip the prefix the snapshot already covers.
        let skip = first_index.saturating_sub(entries[0].get_index()) as usize;
        let entries = &entries[skip..];
        let first_new = entries[0].get_index();
        if first_new > core.last_index() + 1 {
            bail!(
                "gap in raft log: appending {} after {}",
                first_new,
                core.last_index()
            );
        }
        let keep = (first_new - first_index) as usize;
        core.entries.truncate(keep);
        core.entries.extend_from_slice(entries);
        Ok(())
    }

    fn set_hard_state(&self, hs: &HardState) -> anyhow::Result<()> {
        self.write().hard_state = hs.clone();
        Ok(())
    }

    fn set_commit(&self, commit: u64) -> anyhow::Result<()> {
        self.write().hard_state.set_commit(commit);
        Ok(())
    }

    fn set_conf_state(&self, cs: &ConfState) -> anyhow::Result<()> {
        self.write().conf_state = cs.clone();
        Ok(())
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let mut core = self.write();
        let index = snapshot.get_metadata().get_index();
        if index <= core.snapshot.get_metadata().get_index() {
            bail!("snapshot at {} is out of date", index);
        }
        core.conf_state = snapshot.get_metadata().get_conf_state().clone();
        core.hard_state.set_commit(index);
        if snapshot.get_metadata().get_term() > core.hard_state.get_term() {
            core.hard_state.set_term(snapshot.get_metadata().get_term());
        }
        core.entries.clear();
        core.snapshot = snapshot.clone();
        Ok(())
    }

    fn create_snapshot(
        &self,
        index: u64,
        conf_state: Option<ConfState>,
        data: Vec<u8>,
    ) -> anyhow::Result<Snapshot> {
        let term = self
            .term(index)
            .with_context(|| format!("no term for snapshot index {index}"))?;
        let mut core = self.write();
        if index <= core.snapshot.get_metadata().get_index() {
            bail!("snapshot at {} is out of date", index);
        }
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().set_index(index);
        snapshot.mut_metadata().set_term(term);
        snapshot
            .mut_metadata()
            .set_conf_state(conf_state.unwrap_or_else(|| core.conf_state.clone()));
        snapshot.set_data(data.into());
        core.snapshot = snapshot.clone();
        Ok(snapshot)
    }

    fn compact(&self, up_to: u64) -> anyhow::Result<()> {
        let mut core = self.write();
        if up_to < core.first_index() {
            return Ok(());
        }
        if up_to > core.last_index() {
            bail!(
                "compact {} past last index {}",
                up_to,
                core.last_index()
            );
        }
        let offset = core.entries[0].get_index();
        core.entries.drain(..(up_to - offset + 1) as usize);
        Ok(())
    }

    fn current_snapshot(&self) -> Snapshot {
        self.read().snapshot.clone()
    }

    fn entries_range(&self, low: u64, high: u64) -> anyhow::Result<Vec<Entry>> {
        if low >= high {
            return Ok(Vec::new());
        }
        self.entries(low, high, None, GetEntriesContext::empty(false))
            .context("read log entries")
    }
}

/// Provider and consumer of snapshot payload bytes. The payload format is
/// opaque to the sequencer; it only persists and ships the bytes.
pub trait SnapshotHandler: Send + Sync {
    fn provide(
        &self,
        last_snapshot: &Snapshot,
        entries_since: &[Entry],
    ) -> anyhow::Result<Vec<u8>>;
    fn consume(&self, data: &[u8]) -> anyhow::Result<()>;
}

/// Snapshot handler backed by the data store: provides the store's full
/// state and consumes by replaying pairs through a writable transaction.
pub struct StoreSnapshotHandler {
    provider: Arc<dyn DataStoreTxnProvider>,
}

impl StoreSnapshotHandler {
    pub fn new(provider: Arc<dyn DataStoreTxnProvider>) -> Self {
        Self { provider }
    }
}

impl SnapshotHandler for StoreSnapshotHandler {
    fn provide(
        &self,
        _last_snapshot: &Snapshot,
        _entries_since: &[Entry],
    ) -> anyhow::Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        self.provider.snapshot(&mut out as &mut dyn Write)?;
        Ok(out)
    }

    fn consume(&self, data: &[u8]) -> anyhow::Result<()> {
        restore_snapshot(self.provider.as_ref(), data)
    }
}
