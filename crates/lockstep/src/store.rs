//! Data-store seam: the transactional key-value interface workers execute
//! against, with an in-memory engine for tests and single-process runs and a
//! Fjall-backed engine for on-disk nodes.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

/// One store transaction. Reads observe the point-in-time state at the
/// moment of the read plus this transaction's own writes; writes are
/// buffered until commit.
pub trait DataStoreTxn: Send {
    fn get(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn set(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn commit(self: Box<Self>) -> anyhow::Result<()>;
    fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

/// Factory for store transactions plus the snapshot stream used by the
/// replicated-log snapshot plumbing.
pub trait DataStoreTxnProvider: Send + Sync {
    fn start_txn(&self, writable: bool) -> anyhow::Result<Box<dyn DataStoreTxn>>;
    /// Stream the full current state as key/value pairs.
    fn snapshot(&self, out: &mut dyn Write) -> anyhow::Result<()>;
    fn close(&self) -> anyhow::Result<()>;
}

/// In-memory store.
#[derive(Clone, Default)]
pub struct MemStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read for tests and assertions, outside any transaction.
    pub fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().expect("store lock poisoned").get(key).cloned()
    }

    /// All current state, for determinism comparisons.
    pub fn dump(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.read().expect("store lock poisoned").clone()
    }
}

impl DataStoreTxnProvider for MemStore {
    fn start_txn(&self, writable: bool) -> anyhow::Result<Box<dyn DataStoreTxn>> {
        Ok(Box::new(MemTxn {
            data: self.data.clone(),
            writable,
            writes: Vec::new(),
        }))
    }

    fn snapshot(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        let data = self.data.read().expect("store lock poisoned");
        let pairs: Vec<(&[u8], &[u8])> = data
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        serde_json::to_writer(out, &pairs).context("write store snapshot")?;
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct MemTxn {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    writable: bool,
    writes: Vec<(Vec<u8>, Vec<u8>)>,
}

impl DataStoreTxn for MemTxn {
    fn get(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some((_, value)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return Ok(Some(value.clone()));
        }
        Ok(self
            .data
            .read()
            .expect("store lock poisoned")
            .get(key)
            .cloned())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        if !self.writable {
            bail!("set on read-only store transaction");
        }
        self.writes.push((key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn commit(self: Box<Self>) -> anyhow::Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write().expect("store lock poisoned");
        for (key, value) in self.writes {
            data.insert(key, value);
        }
        Ok(())
    }

    fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fjall-backed store: one partition holding the node's key range.
#[derive(Clone)]
pub struct FjallStore {
    keyspace: Keyspace,
    data: PartitionHandle,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open fjall keyspace")?;
        let data = keyspace
            .open_partition("data", PartitionCreateOptions::default())
            .context("open data partition")?;
        Ok(Self { keyspace, data })
    }
}

impl DataStoreTxnProvider for FjallStore {
    fn start_txn(&self, writable: bool) -> anyhow::Result<Box<dyn DataStoreTxn>> {
        Ok(Box::new(FjallTxn {
            keyspace: self.keyspace.clone(),
            data: self.data.clone(),
            writable,
            writes: Vec::new(),
        }))
    }

    fn snapshot(&self, out: &mut dyn Write) -> anyhow::Result<()> {
        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for item in self.data.iter() {
            let (key, value) = item.context("iterate data partition")?;
            pairs.push((key.to_vec(), value.to_vec()));
        }
        serde_json::to_writer(out, &pairs).context("write store snapshot")?;
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist keyspace on close")
    }
}

struct FjallTxn {
    keyspace: Keyspace,
    data: PartitionHandle,
    writable: bool,
    writes: Vec<(Vec<u8>, Vec<u8>)>,
}

impl DataStoreTxn for FjallTxn {
    fn get(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some((_, value)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return Ok(Some(value.clone()));
        }
        let value = self.data.get(key).context("read key")?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        if !self.writable {
            bail!("set on read-only store transaction");
        }
        self.writes.push((key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn commit(self: Box<Self>) -> anyhow::Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut batch = self.keyspace.batch();
        for (key, value) in self.writes {
            batch.insert(&self.data, key, value);
        }
        batch.commit().context("commit store batch")?;
        self.keyspace
            .persist(PersistMode::Buffer)
            .context("persist store batch")
    }

    fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Apply snapshot bytes produced by [`DataStoreTxnProvider::snapshot`]
/// through a writable transaction.
pub fn restore_snapshot(
    provider: &dyn DataStoreTxnProvider,
    data: &[u8],
) -> anyhow::Result<()> {
    let pairs: Vec<(Vec<u8>, Vec<u8>)> =
        serde_json::from_slice(data).context("decode store snapshot")?;
    let mut txn = provider.start_txn(true)?;
    for (key, value) in &pairs {
        txn.set(key, value)?;
    }
    txn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_txn_buffers_writes_until_commit() {
        let store = MemStore::new();
        let mut txn = store.start_txn(true).unwrap();
        txn.set(b"narf", b"narf_value").unwrap();
        assert_eq!(store.value(b"narf"), None);
        txn.commit().unwrap();
        assert_eq!(store.value(b"narf"), Some(b"narf_value".to_vec()));
    }

    #[test]
    fn mem_txn_reads_its_own_writes() {
        let store = MemStore::new();
        let mut txn = store.start_txn(true).unwrap();
        txn.set(b"narf", b"one").unwrap();
        txn.set(b"narf", b"two").unwrap();
        assert_eq!(txn.get(b"narf").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn rollback_discards_writes() {
        let store = MemStore::new();
        let mut txn = store.start_txn(true).unwrap();
        txn.set(b"narf", b"narf_value").unwrap();
        txn.rollback().unwrap();
        assert_eq!(store.value(b"narf"), None);
    }

    #[test]
    fn read_only_txn_rejects_writes() {
        let store = MemStore::new();
        let mut txn = store.start_txn(false).unwrap();
        assert!(txn.set(b"narf", b"v").is_err());
    }

    #[test]
    fn snapshot_round_trips_into_fresh_store() {
        let store = MemStore::new();
        let mut txn = store.start_txn(true).unwrap();
        txn.set(b"narf", b"narf_value").unwrap();
        txn.set(b"moep", b"moep_value").unwrap();
        txn.commit().unwrap();

        let mut raw = Vec::new();
        store.snapshot(&mut raw).unwrap();

        let restored = MemStore::new();
        restore_snapshot(&restored, &raw).unwrap();
        assert_eq!(restored.dump(), store.dump());
    }

    #[test]
    fn fjall_store_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).unwrap();
        let mut txn = store.start_txn(true).unwrap();
        txn.set(b"narf", b"narf_value").unwrap();
        txn.commit().unwrap();

        let mut txn = store.start_txn(false).unwrap();
        assert_eq!(txn.get(b"narf").unwrap(), Some(b"narf_value".to_vec()));
        txn.commit().unwrap();
        store.close().unwrap();
    }
}
