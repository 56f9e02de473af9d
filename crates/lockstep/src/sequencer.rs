//! The sequencer: turns locally submitted transactions into a replicated,
//! totally ordered stream of transaction batches.
//!
//! Submissions accumulate into a batch that is proposed to the raft group on
//! a fixed tick. Committed entries come back in log order on every replica;
//! each normal entry is decoded, stamped with its log position, and handed
//! downstream. The raft cycle itself is delegated to [`LogBackend`], which
//! owns the `RawNode` and the log store.
//!
//! Failures that could break the log's consistency (persisting entries or
//! state, applying snapshots, decoding committed batches) are fatal to the
//! node by policy.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfState, Entry, EntryType, Message, Snapshot};
use raft::{RawNode, SnapshotStatus};
use tracing::{error, info, warn};

use crate::cluster::{annotate_participants, ClusterInfoProvider, NodeId};
use crate::raft_log::{LogStore, SnapshotHandler};
use crate::transport::RaftMessageClient;
use crate::txn::{decode_batch, encode_batch, Transaction, TransactionBatch};

/// Capacity of the submission channels.
const SUBMIT_QUEUE_CAPACITY: usize = 1024;
/// How long shutdown waits for in-flight proposals to commit.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct SequencerConfig {
    pub node_id: NodeId,
    /// Voter set of the replicated log group.
    pub voters: Vec<NodeId>,
    /// Batch tick; the raft clock advances on the same cadence.
    pub batch_interval: Duration,
    /// Cut a snapshot every this many applied entries. Zero disables.
    pub snapshot_frequency: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            voters: vec![1],
            batch_interval: Duration::from_millis(40),
            snapshot_frequency: 1000,
        }
    }
}

/// Handle to a running sequencer. Dropping the handle without calling
/// [`Sequencer::stop`] detaches the writer thread.
pub struct Sequencer {
    txn_tx: Option<Sender<Transaction>>,
    cluster: Arc<dyn ClusterInfoProvider>,
    writer: Option<JoinHandle<()>>,
}

impl Sequencer {
    /// Start the writer thread. Delivered batches appear on `batch_tx` in
    /// strict log order; peer raft traffic arrives on `raft_rx`.
    pub fn start<S: LogStore>(
        config: SequencerConfig,
        log_store: S,
        raft_client: Arc<dyn RaftMessageClient>,
        snapshot_handler: Arc<dyn SnapshotHandler>,
        cluster: Arc<dyn ClusterInfoProvider>,
        batch_tx: Sender<TransactionBatch>,
        raft_rx: Receiver<Message>,
    ) -> anyhow::Result<Self> {
        let (txn_tx, txn_rx) = bounded(SUBMIT_QUEUE_CAPACITY);

        let batch_interval = config.batch_interval;
        let backend = LogBackend::new(
            &config,
            log_store,
            raft_client,
            snapshot_handler,
            batch_tx,
        )?;

        let writer = std::thread::Builder::new()
            .name("sequencer-writer".to_string())
            .spawn(move || run_writer(backend, txn_rx, raft_rx, batch_interval))
            .context("spawn sequencer writer thread")?;

        Ok(Self {
            txn_tx: Some(txn_tx),
            cluster,
            writer: Some(writer),
        })
    }

    /// Enqueue a transaction for the next batch. The participant sets are
    /// computed here, before the transaction enters the log, and never
    /// change afterwards. Blocks briefly if the submission queue is full.
    pub fn submit(&self, mut txn: Transaction) -> anyhow::Result<()> {
        txn.validate()?;
        annotate_participants(&mut txn, self.cluster.as_ref())?;
        let tx = self
            .txn_tx
            .as_ref()
            .context("sequencer already stopped")?;
        tx.send(txn).context("sequencer writer gone")
    }

    /// Close the submission channel, drain the in-flight batch, quiesce
    /// the log, and join the writer. The downstream batch channel closes
    /// when the writer exits.
    pub fn stop(mut self) {
        self.txn_tx.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                error!("sequencer writer thread panicked");
            }
        }
    }
}

/// The writer loop: submissions, the raft clock, and the batch tick race;
/// when nothing is pending, the thread parks for a fraction of the tick.
fn run_writer(
    mut backend: LogBackend<impl LogStore>,
    txn_rx: Receiver<Transaction>,
    raft_rx: Receiver<Message>,
    batch_interval: Duration,
) {
    let mut batch: Vec<Transaction> = Vec::new();
    let batch_ticker = crossbeam_channel::tick(batch_interval);
    let raft_ticker = crossbeam_channel::tick(batch_interval);
    let park = (batch_interval / 10).max(Duration::from_millis(1));

    loop {
        select! {
            recv(txn_rx) -> msg => match msg {
                Ok(txn) => batch.push(txn),
                Err(_) => {
                    warn!("ending writer loop");
                    backend.drain(&mut batch, &raft_rx, batch_interval);
                    return;
                }
            },
            recv(raft_rx) -> msg => {
                if let Ok(message) = msg {
                    backend.step(message);
                }
            }
            recv(raft_ticker) -> _ => backend.tick(),
            recv(batch_ticker) -> _ => backend.propose_batch(&mut batch),
            default(park) => {}
        }
        backend.process_ready();
    }
}

/// Owns the raft node and performs the standard log cycle: persist new
/// entries and hard state before sending messages that depend on them,
/// apply committed entries monotonically, advance.
struct LogBackend<S: LogStore> {
    node_id: NodeId,
    node: RawNode<S>,
    store: S,
    raft_client: Arc<dyn RaftMessageClient>,
    snapshot_handler: Arc<dyn SnapshotHandler>,
    batch_tx: Sender<TransactionBatch>,
    /// Last index handed to the scheduler; bounds the committed → to-apply
    /// slice.
    applied: u64,
    /// Index of the latest local snapshot.
    snapshot_index: u64,
    snapshot_frequency: u64,
    conf_state: ConfState,
    /// The next config change id is this id + 1.
    latest_conf_change_id: u64,
}

impl<S: LogStore> LogBackend<S> {
    fn new(
        config: &SequencerConfig,
        store: S,
        raft_client: Arc<dyn RaftMessageClient>,
        snapshot_handler: Arc<dyn SnapshotHandler>,
        batch_tx: Sender<TransactionBatch>,
    ) -> anyhow::Result<Self> {
        let snapshot = store.current_snapshot();
        let applied = snapshot.get_metadata().get_index();

        let raft_config = raft::Config {
            id: config.node_id,
            election_tick: 7,
            heartbeat_tick: 5,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            applied,
            ..Default::default()
        };
        raft_config.validate().context("raft config")?;

        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let mut node = RawNode::new(&raft_config, store.clone(), &logger)
            .context("create raft node")?;
        if config.voters == [config.node_id] {
            // A single-voter group can elect itself right away instead of
            // waiting out an election timeout.
            node.campaign().context("campaign single-voter group")?;
        }

        Ok(Self {
            node_id: config.node_id,
            node,
            store,
            raft_client,
            snapshot_handler,
            batch_tx,
            applied,
            snapshot_index: applied,
            snapshot_frequency: config.snapshot_frequency,
            conf_state: ConfState::default(),
            latest_conf_change_id: 0,
        })
    }

    fn tick(&mut self) {
        self.node.tick();
    }

    fn step(&mut self, message: Message) {
        if let Err(err) = self.node.step(message) {
            warn!(error = %err, "raft rejected peer message");
        }
    }

    /// Propose the current batch if it is non-empty; either way a fresh
    /// empty batch takes its place.
    fn propose_batch(&mut self, batch: &mut Vec<Transaction>) {
        if batch.is_empty() {
            return;
        }
        let pending = TransactionBatch {
            transactions: std::mem::take(batch),
            ..Default::default()
        };
        let data = match encode_batch(&pending) {
            Ok(data) => data,
            Err(err) => {
                error!(error = %err, "dropping unencodable batch");
                return;
            }
        };
        if let Err(err) = self.node.propose(Vec::new(), data) {
            // Typical before the group has a leader; the submissions are
            // dropped and the client retries.
            error!(error = %err, transactions = pending.transactions.len(), "batch proposal failed");
        }
    }

    /// Run one full Ready cycle. Returns whether there was anything to do.
    fn process_ready(&mut self) -> bool {
        if !self.node.has_ready() {
            return false;
        }
        let mut ready = self.node.ready();

        // Messages that do not depend on this cycle's persistence.
        self.send_messages(ready.take_messages());

        if *ready.snapshot() != Snapshot::default() {
            let snapshot = ready.snapshot().clone();
            if let Err(err) = self.store.apply_snapshot(&snapshot) {
                panic!("failed to persist received snapshot: {err:#}");
            }
            if let Err(err) = self.snapshot_handler.consume(snapshot.get_data()) {
                panic!("failed to consume snapshot payload: {err:#}");
            }
            self.applied = snapshot.get_metadata().get_index();
            self.snapshot_index = self.applied;
        }

        let committed = ready.take_committed_entries();
        self.publish_entries(self.entries_to_apply(committed));

        if let Err(err) = self.store.append(ready.entries()) {
            panic!("failed to persist raft entries: {err:#}");
        }
        if let Some(hard_state) = ready.hs() {
            if let Err(err) = self.store.set_hard_state(hard_state) {
                panic!("failed to persist raft hard state: {err:#}");
            }
        }

        // Messages that had to wait for the entries and state above.
        self.send_messages(ready.take_persisted_messages());

        let mut light = self.node.advance(ready);
        if let Some(commit) = light.commit_index() {
            if let Err(err) = self.store.set_commit(commit) {
                panic!("failed to persist commit index: {err:#}");
            }
        }
        self.send_messages(light.take_messages());
        let committed = light.take_committed_entries();
        self.publish_entries(self.entries_to_apply(committed));
        self.node.advance_apply();

        self.maybe_trigger_snapshot();
        true
    }

    /// The first index of any to-apply slice can never run ahead of what
    /// has already been applied.
    fn entries_to_apply(&self, entries: Vec<Entry>) -> Vec<Entry> {
        if let Some(first) = entries.first() {
            if first.get_index() > self.applied + 1 {
                panic!(
                    "first index of committed entry [{}] should be <= applied [{}] + 1",
                    first.get_index(),
                    self.applied
                );
            }
        }
        entries
    }

    fn publish_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            match entry.get_entry_type() {
                EntryType::EntryNormal => self.publish_transaction_batch(&entry),
                EntryType::EntryConfChange => self.publish_config_change(&entry),
                EntryType::EntryConfChangeV2 => {
                    warn!(index = entry.get_index(), "ignoring v2 config change entry");
                }
            }
            self.applied = entry.get_index();
        }
    }

    fn publish_transaction_batch(&mut self, entry: &Entry) {
        if entry.get_data().is_empty() {
            // Raft appends an empty entry when a leader takes over.
            return;
        }
        let mut batch = match decode_batch(entry.get_data()) {
            Ok(batch) => batch,
            Err(err) => panic!("undecodable batch in the log: {err:#}"),
        };
        batch.term = entry.get_term();
        batch.index = entry.get_index();
        batch.node_id = self.node_id;
        if self.batch_tx.send(batch).is_err() {
            panic!("scheduler channel closed with the log still applying");
        }
    }

    fn publish_config_change(&mut self, entry: &Entry) {
        let mut change = ConfChange::default();
        if let Err(err) = change.merge_from_bytes(entry.get_data()) {
            panic!("undecodable config change in the log: {err:#}");
        }
        info!(id = change.get_id(), change = ?change.get_change_type(), node = change.get_node_id(), "applying config change");
        let conf_state = match self.node.apply_conf_change(&change) {
            Ok(state) => state,
            Err(err) => panic!("failed to apply config change: {err:#}"),
        };
        if let Err(err) = self.store.set_conf_state(&conf_state) {
            panic!("failed to persist config state: {err:#}");
        }
        self.conf_state = conf_state;
        self.latest_conf_change_id = change.get_id();
    }

    /// Cut a snapshot once enough entries have been applied since the last
    /// one, then compact the log behind it.
    fn maybe_trigger_snapshot(&mut self) {
        if self.snapshot_frequency == 0 {
            return;
        }
        if self.applied < self.snapshot_index + self.snapshot_frequency {
            return;
        }
        let last_snapshot = self.store.current_snapshot();
        let since_index = last_snapshot.get_metadata().get_index();
        let entries = match self.store.entries_range(since_index + 1, self.applied + 1) {
            Ok(entries) => entries,
            Err(err) => panic!("failed to read entries for snapshot: {err:#}"),
        };
        let data = match self.snapshot_handler.provide(&last_snapshot, &entries) {
            Ok(data) => data,
            Err(err) => panic!("snapshot handler failed to provide: {err:#}"),
        };
        let conf_state = if self.conf_state == ConfState::default() {
            None
        } else {
            Some(self.conf_state.clone())
        };
        if let Err(err) = self.store.create_snapshot(self.applied, conf_state, data) {
            panic!("failed to cut snapshot at {}: {err:#}", self.applied);
        }
        if let Err(err) = self.store.compact(self.applied) {
            panic!("failed to compact log to {}: {err:#}", self.applied);
        }
        info!(index = self.applied, "snapshot cut and log compacted");
        self.snapshot_index = self.applied;
    }

    /// Inspect send failures per message: failed snapshot sends are
    /// reported back to the log so it can retry, successful ones finish the
    /// transfer. Other send failures are left to the log's own heartbeats,
    /// which avoids reachability flapping.
    fn send_messages(&mut self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let report = self.raft_client.send_messages(messages);
        for failed in &report.failed {
            if failed.get_msg_type() == raft::eraftpb::MessageType::MsgSnapshot {
                error!(to = failed.get_to(), "reporting snapshot send failure");
                self.node
                    .report_snapshot(failed.get_to(), SnapshotStatus::Failure);
            }
        }
        for &to in &report.succeeded_snapshots {
            self.node.report_snapshot(to, SnapshotStatus::Finish);
        }
    }

    /// Propose what is left, wait for it to apply, and quiesce.
    fn drain(
        &mut self,
        batch: &mut Vec<Transaction>,
        raft_rx: &Receiver<Message>,
        batch_interval: Duration,
    ) {
        self.propose_batch(batch);
        let target = self.node.raft.raft_log.last_index();
        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        let park = (batch_interval / 10).max(Duration::from_millis(1));
        let mut next_tick = Instant::now() + batch_interval;

        while self.applied < target && Instant::now() < deadline {
            while let Ok(message) = raft_rx.try_recv() {
                self.step(message);
            }
            if Instant::now() >= next_tick {
                self.tick();
                next_tick += batch_interval;
            }
            if !self.process_ready() {
                std::thread::sleep(park);
            }
        }
        if self.applied < target {
            warn!(
                applied = self.applied,
                target, "sequencer stopped before draining the log"
            );
        }
    }
}
