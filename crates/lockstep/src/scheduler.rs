//! Scheduler bridge.
//!
//! A narrow adapter between the sequencer and the execution engine: batches
//! arrive in log order and leave as individual transactions, in the same
//! order, on the bounded scheduled channel the worker pool competes over.

use std::thread::JoinHandle;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error};

use crate::txn::{Transaction, TransactionBatch};

pub struct Scheduler {
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Forward transactions until the upstream batch channel closes; the
    /// scheduled channel closes behind it.
    pub fn start(
        batch_rx: Receiver<TransactionBatch>,
        scheduled_tx: Sender<Transaction>,
    ) -> anyhow::Result<Self> {
        let handle = std::thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || run(batch_rx, scheduled_tx))
            .context("spawn scheduler thread")?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the bridge to finish (the upstream channel must close
    /// first).
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }
}

fn run(batch_rx: Receiver<TransactionBatch>, scheduled_tx: Sender<Transaction>) {
    for batch in batch_rx.iter() {
        debug!(
            index = batch.index,
            term = batch.term,
            transactions = batch.transactions.len(),
            "scheduling batch"
        );
        for txn in batch.transactions {
            if scheduled_tx.send(txn).is_err() {
                error!("execution engine gone; dropping remainder of the log");
                return;
            }
        }
    }
}
