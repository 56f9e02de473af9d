//! Cluster topology: which node owns which key.
//!
//! The cluster-info file is read once at startup into an immutable
//! [`ClusterInfo`] snapshot. Collaborators receive the snapshot by `Arc` at
//! construction; a topology reload would be an explicit swap at the owner,
//! never a mutation observed mid-flight.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::txn::Transaction;

/// Logical node identifier.
pub type NodeId = u64;

/// One node entry from the cluster-info file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub hostname: String,
    pub port: u16,
    /// Partitions this node stores.
    pub partitions: Vec<u32>,
}

/// Parsed cluster-info file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub number_primaries: u32,
    pub number_partitions: u32,
    pub nodes: Vec<NodeInfo>,
}

impl ClusterInfo {
    /// Read and validate a TOML cluster-info file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("read cluster info {}", path.as_ref().display()))?;
        let info: ClusterInfo = toml::from_str(&raw).context("parse cluster info")?;
        info.validate()?;
        Ok(info)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.number_partitions == 0 {
            bail!("cluster info declares zero partitions");
        }
        if self.nodes.is_empty() {
            bail!("cluster info declares no nodes");
        }
        let mut ids = BTreeSet::new();
        for node in &self.nodes {
            if node.node_id == 0 {
                bail!("node id 0 is reserved");
            }
            if !ids.insert(node.node_id) {
                bail!("duplicate node id {}", node.node_id);
            }
            for &p in &node.partitions {
                if p >= self.number_partitions {
                    bail!(
                        "node {} lists partition {} outside 0..{}",
                        node.node_id,
                        p,
                        self.number_partitions
                    );
                }
            }
        }
        Ok(())
    }

    /// Partition owning `key`: FNV-1 64-bit hash mod partition count.
    pub fn partition_for_key(&self, key: &[u8]) -> u32 {
        (fnv1_64(key) % u64::from(self.number_partitions)) as u32
    }

    /// The node responsible for `key`: the lowest node id whose partition
    /// list contains the key's partition. Pure in the key and the map.
    pub fn owner_for_key(&self, key: &[u8]) -> Option<NodeId> {
        let partition = self.partition_for_key(key);
        self.nodes
            .iter()
            .filter(|n| n.partitions.contains(&partition))
            .map(|n| n.node_id)
            .min()
    }

    pub fn node(&self, node_id: NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Node ids of the primary replicas, in id order. These form the
    /// replicated-log voter set.
    pub fn primary_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| n.node_id).collect();
        ids.sort_unstable();
        ids.truncate(self.number_primaries.max(1) as usize);
        ids
    }
}

/// Topology questions the sequencer and workers ask.
pub trait ClusterInfoProvider: Send + Sync {
    /// Does this node store `key`?
    fn is_local(&self, key: &[u8]) -> bool;
    /// Is this node one of the given writers?
    fn am_i_writer(&self, writer_nodes: &[NodeId]) -> bool;
    fn find_owner_for_key(&self, key: &[u8]) -> Option<NodeId>;
    fn get_address_for(&self, node_id: NodeId) -> Option<String>;
}

/// [`ClusterInfoProvider`] over an immutable topology snapshot, bound to the
/// local node id.
#[derive(Clone)]
pub struct LocalClusterInfo {
    info: Arc<ClusterInfo>,
    node_id: NodeId,
}

impl LocalClusterInfo {
    pub fn new(info: Arc<ClusterInfo>, node_id: NodeId) -> anyhow::Result<Self> {
        if info.node(node_id).is_none() {
            bail!("node {node_id} not present in cluster info");
        }
        Ok(Self { info, node_id })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }
}

impl ClusterInfoProvider for LocalClusterInfo {
    fn is_local(&self, key: &[u8]) -> bool {
        let partition = self.info.partition_for_key(key);
        self.info
            .node(self.node_id)
            .map(|n| n.partitions.contains(&partition))
            .unwrap_or(false)
    }

    fn am_i_writer(&self, writer_nodes: &[NodeId]) -> bool {
        writer_nodes.contains(&self.node_id)
    }

    fn find_owner_for_key(&self, key: &[u8]) -> Option<NodeId> {
        self.info.owner_for_key(key)
    }

    fn get_address_for(&self, node_id: NodeId) -> Option<String> {
        self.info
            .node(node_id)
            .map(|n| format!("{}:{}", n.hostname, n.port))
    }
}

/// Fill in a transaction's participant sets from key ownership: read-write
/// keys put their owner in both sets, read-only keys in the reader set.
/// Sets come out sorted and deduplicated; never mutated after submission.
pub fn annotate_participants(
    txn: &mut Transaction,
    cluster: &dyn ClusterInfoProvider,
) -> anyhow::Result<()> {
    let mut writers = BTreeSet::new();
    let mut readers = BTreeSet::new();
    for key in &txn.read_write_set {
        let owner = cluster
            .find_owner_for_key(key)
            .with_context(|| format!("no owner for key {:?}", String::from_utf8_lossy(key)))?;
        writers.insert(owner);
        readers.insert(owner);
    }
    for key in &txn.read_set {
        let owner = cluster
            .find_owner_for_key(key)
            .with_context(|| format!("no owner for key {:?}", String::from_utf8_lossy(key)))?;
        readers.insert(owner);
    }
    txn.writer_nodes = writers.into_iter().collect();
    txn.reader_nodes = readers.into_iter().collect();
    Ok(())
}

/// FNV-1 64-bit hash (multiply, then xor).
fn fnv1_64(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash = hash.wrapping_mul(PRIME);
        hash ^= u64::from(byte);
    }
    hash
}
