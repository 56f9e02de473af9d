//! The execution engine: a fixed pool of workers that turn ordered
//! transactions into deterministic state changes.
//!
//! Each worker interleaves two phases. In the input phase it performs the
//! local reads for a scheduled transaction, records the transaction if this
//! node is a writer, and broadcasts the reads to every writer participant.
//! In the execution phase it picks up a completed environment, runs the
//! stored procedure against the resolved read view, and commits. Selection
//! between the phases is fair; neither starves the other.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterInfoProvider;
use crate::ids::TransactionId;
use crate::procedures::{init_stored_procedures, LuaExecutor, ProcedureRegistry};
use crate::remote_read::{RemoteReadRequest, RemoteReadTracker, TxnExecEnvironment};
use crate::store::DataStoreTxnProvider;
use crate::transport::ConnectionCache;
use crate::txn::Transaction;

/// Capacity of the ready-to-execute channel.
const READY_QUEUE_CAPACITY: usize = 16;

/// Outcome of one transaction, reported to the acknowledger.
#[derive(Clone, Debug)]
pub struct CompletedTxn {
    pub txn: Transaction,
    /// Present when the stored procedure failed and the transaction rolled
    /// back.
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub num_workers: usize,
    /// Idle timeout after which incomplete environments are swept.
    pub env_idle_timeout: Duration,
    /// Stored procedures available to workers; read-only once started.
    pub procedures: ProcedureRegistry,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            env_idle_timeout: Duration::from_secs(30),
            procedures: init_stored_procedures(),
        }
    }
}

type PendingMap = Arc<RwLock<HashMap<TransactionId, Transaction>>>;

/// Handle to the worker pool. `stop` signals every worker to finish its
/// current transaction and exit.
pub struct Engine {
    stop_tx: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    gc: Option<JoinHandle<()>>,
    tracker: Arc<RemoteReadTracker>,
    pending: PendingMap,
}

impl Engine {
    pub fn start(
        config: EngineConfig,
        scheduled_rx: Receiver<Transaction>,
        done_tx: Sender<CompletedTxn>,
        provider: Arc<dyn DataStoreTxnProvider>,
        conn_cache: Arc<dyn ConnectionCache>,
        cluster: Arc<dyn ClusterInfoProvider>,
    ) -> anyhow::Result<Self> {
        let (ready_tx, ready_rx) = bounded(READY_QUEUE_CAPACITY);
        let tracker = RemoteReadTracker::new(ready_tx, config.env_idle_timeout);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let procs = Arc::new(config.procedures.clone());

        let mut workers = Vec::with_capacity(config.num_workers.max(1));
        for i in 0..config.num_workers.max(1) {
            let worker = Worker {
                scheduled_rx: scheduled_rx.clone(),
                ready_rx: ready_rx.clone(),
                stop_rx: stop_rx.clone(),
                done_tx: done_tx.clone(),
                provider: provider.clone(),
                conn_cache: conn_cache.clone(),
                cluster: cluster.clone(),
                pending: pending.clone(),
                procs: procs.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("engine-worker-{i}"))
                .spawn(move || worker.run())
                .context("spawn engine worker")?;
            workers.push(handle);
        }

        let gc = {
            let tracker = tracker.clone();
            let stop_rx = stop_rx.clone();
            std::thread::Builder::new()
                .name("engine-env-gc".to_string())
                .spawn(move || tracker.run_gc(stop_rx))
                .context("spawn environment gc")?
        };

        Ok(Self {
            stop_tx: Some(stop_tx),
            workers,
            gc: Some(gc),
            tracker,
            pending,
        })
    }

    /// Deposit endpoint for the RemoteRead server.
    pub fn remote_reads(&self) -> Arc<RemoteReadTracker> {
        self.tracker.clone()
    }

    /// Whether a transaction is recorded for execution on this node.
    pub fn is_pending(&self, txn_id: &TransactionId) -> bool {
        self.pending
            .read()
            .expect("pending map poisoned")
            .contains_key(txn_id)
    }

    /// Signal all workers to finish their current work and exit, then join
    /// them. In-flight transactions past the stop point are abandoned.
    pub fn stop(mut self) {
        self.stop_tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("engine worker panicked");
            }
        }
        if let Some(gc) = self.gc.take() {
            let _ = gc.join();
        }
    }
}

struct Worker {
    scheduled_rx: Receiver<Transaction>,
    ready_rx: Receiver<TxnExecEnvironment>,
    stop_rx: Receiver<()>,
    done_tx: Sender<CompletedTxn>,
    provider: Arc<dyn DataStoreTxnProvider>,
    conn_cache: Arc<dyn ConnectionCache>,
    cluster: Arc<dyn ClusterInfoProvider>,
    pending: PendingMap,
    procs: Arc<ProcedureRegistry>,
}

impl Worker {
    fn run(mut self) {
        // The interpreter lives and dies with this thread.
        let mut lua = match LuaExecutor::new() {
            Ok(lua) => lua,
            Err(err) => {
                error!(error = %format!("{err:#}"), "worker interpreter failed to start");
                return;
            }
        };
        let scheduled_rx = self.scheduled_rx.clone();
        let ready_rx = self.ready_rx.clone();
        let stop_rx = self.stop_rx.clone();
        let closed = never::<Transaction>();
        let mut scheduled_open = true;
        loop {
            let scheduled = if scheduled_open { &scheduled_rx } else { &closed };
            select! {
                // Wait for transactions to be scheduled.
                recv(scheduled) -> msg => match msg {
                    Ok(txn) => self.process_scheduled(txn),
                    // Input stream closed; keep serving ready environments.
                    Err(_) => scheduled_open = false,
                },
                // Wait for environments whose remote reads are complete.
                recv(ready_rx) -> msg => match msg {
                    Ok(env) => self.run_ready(env, &mut lua),
                    Err(_) => return,
                },
                recv(stop_rx) -> msg => {
                    if msg.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Input phase: local reads, writer bookkeeping, broadcast.
    fn process_scheduled(&mut self, txn: Transaction) {
        debug!(txn_id = %txn.id, proc = %txn.stored_procedure, "scheduled transaction");

        let mut store_txn = match self.provider.start_txn(false) {
            Ok(store_txn) => store_txn,
            Err(err) => {
                error!(txn_id = %txn.id, error = %format!("{err:#}"), "cannot open read transaction; abandoning");
                return;
            }
        };
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for key in txn.read_set.iter().chain(txn.read_write_set.iter()) {
            if !self.cluster.is_local(key) {
                continue;
            }
            match store_txn.get(key) {
                Ok(value) => {
                    keys.push(key.clone());
                    // Missing keys resolve to the empty value.
                    values.push(value.unwrap_or_default());
                }
                Err(err) => {
                    error!(txn_id = %txn.id, error = %format!("{err:#}"), "local read failed; abandoning");
                    let _ = store_txn.rollback();
                    return;
                }
            }
        }
        // The read view is point-in-time; release it before the fan-out.
        if let Err(err) = store_txn.commit() {
            error!(txn_id = %txn.id, error = %format!("{err:#}"), "read transaction commit failed; abandoning");
            return;
        }

        if self.cluster.am_i_writer(&txn.writer_nodes) {
            self.pending
                .write()
                .expect("pending map poisoned")
                .insert(txn.id, txn.clone());
        }

        self.broadcast_local_reads(&txn, keys, values);
    }

    /// Fan local reads out to every writer participant, the local node
    /// included. A failed broadcast would leave writers with diverging
    /// environments, so it is fatal to the node.
    fn broadcast_local_reads(
        &self,
        txn: &Transaction,
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
    ) {
        let total_num_locks = txn.total_num_locks();
        for &node_id in &txn.writer_nodes {
            let client = match self.conn_cache.remote_read_client(node_id) {
                Ok(client) => client,
                Err(err) => panic!("no remote-read client for writer node {node_id}: {err:#}"),
            };
            let request = RemoteReadRequest {
                txn_id: txn.id,
                total_num_locks,
                keys: keys.clone(),
                values: values.clone(),
            };
            match client.remote_read(request) {
                Ok(response) if response.error.is_empty() => {}
                Ok(response) => panic!(
                    "writer node {node_id} rejected remote read for {}: {}",
                    txn.id, response.error
                ),
                Err(err) => panic!(
                    "remote read broadcast to writer node {node_id} failed for {}: {err:#}",
                    txn.id
                ),
            }
        }
    }

    /// Execution phase: run the stored procedure against the resolved read
    /// view and commit.
    fn run_ready(&mut self, env: TxnExecEnvironment, lua: &mut LuaExecutor) {
        let txn = match self
            .pending
            .write()
            .expect("pending map poisoned")
            .remove(&env.txn_id)
        {
            Some(txn) => txn,
            None => panic!(
                "cannot find transaction [{}] for a complete environment",
                env.txn_id
            ),
        };

        let mut store_txn = match self.provider.start_txn(true) {
            Ok(store_txn) => store_txn,
            Err(err) => {
                error!(txn_id = %txn.id, error = %format!("{err:#}"), "cannot open write transaction; abandoning");
                return;
            }
        };

        match lua.run(&txn, &env, &self.procs) {
            Ok(writes) => {
                for (key, value) in &writes {
                    if let Err(err) = store_txn.set(key, value) {
                        error!(txn_id = %txn.id, error = %format!("{err:#}"), "store write failed; abandoning");
                        let _ = store_txn.rollback();
                        return;
                    }
                }
                if let Err(err) = store_txn.commit() {
                    error!(txn_id = %txn.id, error = %format!("{err:#}"), "commit failed; abandoning");
                    return;
                }
                info!(txn_id = %txn.id, "ran txn");
                let _ = self.done_tx.send(CompletedTxn { txn, error: None });
            }
            Err(err) => {
                if let Err(rb) = store_txn.rollback() {
                    error!(txn_id = %txn.id, error = %format!("{rb:#}"), "rollback failed");
                }
                warn!(txn_id = %txn.id, error = %format!("{err:#}"), "stored procedure failed");
                let _ = self.done_tx.send(CompletedTxn {
                    txn,
                    error: Some(format!("{err:#}")),
                });
            }
        }
    }
}
