//! Native transaction types, wire conversions, and the log-entry codec.
//!
//! Transactions cross two serialization boundaries: the gRPC wire (protobuf
//! types generated into `volo_gen`) and the replicated log (batches encoded
//! with serde, the same way the control plane encodes its consensus
//! commands). Native structs stay the single in-process representation;
//! conversions at each boundary are explicit.

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::ids::TransactionId;
use crate::volo_gen::lockstep::rpc;

/// One deterministic transaction: declared key sets, participant node sets,
/// and the stored procedure to run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Keys read but never written.
    pub read_set: Vec<Vec<u8>>,
    /// Keys read and written.
    pub read_write_set: Vec<Vec<u8>>,
    /// Nodes owning at least one key in `read_write_set`.
    pub writer_nodes: Vec<NodeId>,
    /// Nodes owning at least one key in either set.
    pub reader_nodes: Vec<NodeId>,
    pub stored_procedure: String,
    pub stored_procedure_args: Vec<Vec<u8>>,
}

impl Transaction {
    pub fn new(id: TransactionId, stored_procedure: impl Into<String>) -> Self {
        Self {
            id,
            read_set: Vec::new(),
            read_write_set: Vec::new(),
            writer_nodes: Vec::new(),
            reader_nodes: Vec::new(),
            stored_procedure: stored_procedure.into(),
            stored_procedure_args: Vec::new(),
        }
    }

    pub fn add_read_key(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.read_set.push(key.into());
        self
    }

    pub fn add_read_write_key(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.read_write_set.push(key.into());
        self
    }

    pub fn add_arg(&mut self, arg: impl Into<Vec<u8>>) -> &mut Self {
        self.stored_procedure_args.push(arg.into());
        self
    }

    /// Number of participations expected before the transaction may execute:
    /// one per declared key.
    pub fn total_num_locks(&self) -> u32 {
        (self.read_set.len() + self.read_write_set.len()) as u32
    }

    /// Check the structural invariants: no key appears twice across the two
    /// sets, and every writer node is also a reader node.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for key in self.read_set.iter().chain(self.read_write_set.iter()) {
            if !seen.insert(key.as_slice()) {
                bail!(
                    "key {:?} appears more than once across read and read-write sets",
                    String::from_utf8_lossy(key)
                );
            }
        }
        for node in &self.writer_nodes {
            if !self.reader_nodes.contains(node) {
                bail!("writer node {node} missing from reader nodes");
            }
        }
        Ok(())
    }
}

/// The unit of consensus: an ordered run of transactions plus the log
/// position stamped on delivery.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionBatch {
    pub transactions: Vec<Transaction>,
    pub term: u64,
    pub index: u64,
    pub node_id: NodeId,
}

impl TransactionBatch {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Encode a batch for a replicated-log entry.
pub fn encode_batch(batch: &TransactionBatch) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(batch).context("encode transaction batch")
}

/// Decode a batch from a replicated-log entry and re-check its invariants.
pub fn decode_batch(data: &[u8]) -> anyhow::Result<TransactionBatch> {
    let batch: TransactionBatch =
        serde_json::from_slice(data).context("decode transaction batch")?;
    for txn in &batch.transactions {
        txn.validate()
            .with_context(|| format!("invalid transaction {} in batch", txn.id))?;
    }
    Ok(batch)
}

pub fn to_rpc_txn_id(id: TransactionId) -> rpc::TransactionId {
    rpc::TransactionId {
        msb: id.msb(),
        lsb: id.lsb(),
    }
}

pub fn from_rpc_txn_id_required(
    id: Option<rpc::TransactionId>,
) -> anyhow::Result<TransactionId> {
    let id = id.ok_or_else(|| anyhow!("missing txn_id"))?;
    Ok(TransactionId::from_parts(id.msb, id.lsb))
}

pub fn to_rpc_txn(txn: &Transaction) -> rpc::Transaction {
    rpc::Transaction {
        id: Some(to_rpc_txn_id(txn.id)),
        read_set: txn.read_set.iter().cloned().map(Into::into).collect(),
        read_write_set: txn
            .read_write_set
            .iter()
            .cloned()
            .map(Into::into)
            .collect(),
        writer_nodes: txn.writer_nodes.clone(),
        reader_nodes: txn.reader_nodes.clone(),
        stored_procedure: txn.stored_procedure.clone().into(),
        stored_procedure_args: txn
            .stored_procedure_args
            .iter()
            .cloned()
            .map(Into::into)
            .collect(),
    }
}

pub fn from_rpc_txn(txn: rpc::Transaction) -> anyhow::Result<Transaction> {
    Ok(Transaction {
        id: from_rpc_txn_id_required(txn.id)?,
        read_set: txn.read_set.into_iter().map(|k| k.to_vec()).collect(),
        read_write_set: txn
            .read_write_set
            .into_iter()
            .map(|k| k.to_vec())
            .collect(),
        writer_nodes: txn.writer_nodes,
        reader_nodes: txn.reader_nodes,
        stored_procedure: txn.stored_procedure.to_string(),
        stored_procedure_args: txn
            .stored_procedure_args
            .into_iter()
            .map(|a| a.to_vec())
            .collect(),
    })
}

pub fn to_rpc_batch(batch: &TransactionBatch) -> rpc::TransactionBatch {
    rpc::TransactionBatch {
        transactions: batch.transactions.iter().map(to_rpc_txn).collect(),
        term: batch.term,
        index: batch.index,
        node_id: batch.node_id,
    }
}

pub fn from_rpc_batch(batch: rpc::TransactionBatch) -> anyhow::Result<TransactionBatch> {
    let mut transactions = Vec::with_capacity(batch.transactions.len());
    for txn in batch.transactions {
        transactions.push(from_rpc_txn(txn)?);
    }
    Ok(TransactionBatch {
        transactions,
        term: batch.term,
        index: batch.index,
        node_id: batch.node_id,
    })
}
