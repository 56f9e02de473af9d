//! In-process end-to-end tests: sequencer → scheduler → execution engine.
//!
//! The single-node tests drive one full pipeline over an in-memory store.
//! The two-replica test wires two nodes with disjoint partition ownership
//! as peers over a routing loopback transport, feeds both the same ordered
//! batch stream, and checks that their post-execution stores are bitwise
//! identical for every transaction key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use lockstep::cluster::{ClusterInfo, LocalClusterInfo, NodeId, NodeInfo};
use lockstep::execution::{CompletedTxn, Engine, EngineConfig};
use lockstep::ids::TransactionId;
use lockstep::procedures::init_stored_procedures;
use lockstep::raft_log::{MemLogStore, StoreSnapshotHandler};
use lockstep::remote_read::{RemoteReadRequest, RemoteReadResponse, RemoteReadTracker};
use lockstep::scheduler::Scheduler;
use lockstep::sequencer::{Sequencer, SequencerConfig};
use lockstep::store::{DataStoreTxnProvider, MemStore};
use lockstep::transport::{
    ConnectionCache, RaftMessageClient, RemoteReadClient, SendReport,
};
use lockstep::txn::{Transaction, TransactionBatch};

const APPEND_MARK: &str = "append_mark";
const APPEND_MARK_SRC: &str = r#"
for i = 1, ARGC
do
    store:Set(ARGV[i], store:Get(ARGV[i]) .. "!")
end
"#;

/// Remote-read fan-out that routes each broadcast to the destination
/// node's rendezvous tracker, standing in for the gRPC hop between peers.
#[derive(Clone, Default)]
struct RoutingCache {
    trackers: Arc<Mutex<HashMap<NodeId, Arc<RemoteReadTracker>>>>,
}

impl RoutingCache {
    fn register(&self, node_id: NodeId, tracker: Arc<RemoteReadTracker>) {
        self.trackers.lock().unwrap().insert(node_id, tracker);
    }
}

struct RoutingClient {
    node_id: NodeId,
    trackers: Arc<Mutex<HashMap<NodeId, Arc<RemoteReadTracker>>>>,
}

impl RemoteReadClient for RoutingClient {
    fn remote_read(&self, request: RemoteReadRequest) -> anyhow::Result<RemoteReadResponse> {
        let tracker = self
            .trackers
            .lock()
            .unwrap()
            .get(&self.node_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no peer registered for node {}", self.node_id))?;
        match tracker.deposit(request) {
            Ok(()) => Ok(RemoteReadResponse::default()),
            Err(error) => Ok(RemoteReadResponse { error }),
        }
    }
}

impl ConnectionCache for RoutingCache {
    fn remote_read_client(&self, node_id: NodeId) -> anyhow::Result<Arc<dyn RemoteReadClient>> {
        Ok(Arc::new(RoutingClient {
            node_id,
            trackers: self.trackers.clone(),
        }))
    }
    fn raft_client(&self, _node_id: NodeId) -> anyhow::Result<Arc<dyn RaftMessageClient>> {
        Ok(Arc::new(NoPeers))
    }
    fn close(&self) {}
}

struct NoPeers;

impl RaftMessageClient for NoPeers {
    fn send_messages(&self, _messages: Vec<raft::eraftpb::Message>) -> SendReport {
        SendReport::default()
    }
}

fn single_node_cluster() -> Arc<ClusterInfo> {
    Arc::new(ClusterInfo {
        number_primaries: 1,
        number_partitions: 4,
        nodes: vec![NodeInfo {
            node_id: 1,
            hostname: "localhost".to_string(),
            port: 5598,
            partitions: vec![0, 1, 2, 3],
        }],
    })
}

fn two_node_cluster() -> Arc<ClusterInfo> {
    Arc::new(ClusterInfo {
        number_primaries: 2,
        number_partitions: 4,
        nodes: vec![
            NodeInfo {
                node_id: 1,
                hostname: "localhost".to_string(),
                port: 5598,
                partitions: vec![0, 1],
            },
            NodeInfo {
                node_id: 2,
                hostname: "localhost".to_string(),
                port: 5599,
                partitions: vec![2, 3],
            },
        ],
    })
}

/// The first `count` generated keys owned by `node_id`.
fn keys_owned_by(info: &ClusterInfo, node_id: NodeId, count: usize) -> Vec<Vec<u8>> {
    (0u32..)
        .map(|i| format!("k{i}").into_bytes())
        .filter(|key| info.owner_for_key(key) == Some(node_id))
        .take(count)
        .collect()
}

fn seed_pairs(keys: &[Vec<u8>]) -> Vec<(Vec<u8>, Vec<u8>)> {
    keys.iter()
        .map(|key| {
            let mut value = key.clone();
            value.extend_from_slice(b"_value");
            (key.clone(), value)
        })
        .collect()
}

/// One replica's scheduler, engine, and store, fed by a batch channel.
struct Replica {
    scheduler: Scheduler,
    engine: Engine,
    done_rx: Receiver<CompletedTxn>,
    store: MemStore,
}

impl Replica {
    fn start(
        info: Arc<ClusterInfo>,
        node_id: NodeId,
        cache: &RoutingCache,
        seed: &[(Vec<u8>, Vec<u8>)],
    ) -> (Self, Sender<TransactionBatch>) {
        let cluster = Arc::new(LocalClusterInfo::new(info, node_id).unwrap());
        let store = MemStore::new();
        let mut txn = store.start_txn(true).unwrap();
        for (key, value) in seed {
            txn.set(key, value).unwrap();
        }
        txn.commit().unwrap();

        let (batch_tx, batch_rx) = bounded(16);
        let (scheduled_tx, scheduled_rx) = bounded(64);
        let (done_tx, done_rx) = bounded(64);
        let scheduler = Scheduler::start(batch_rx, scheduled_tx).unwrap();
        let engine = Engine::start(
            EngineConfig {
                procedures: init_stored_procedures()
                    .with_procedure(APPEND_MARK, APPEND_MARK_SRC),
                ..Default::default()
            },
            scheduled_rx,
            done_tx,
            Arc::new(store.clone()),
            Arc::new(cache.clone()),
            cluster,
        )
        .unwrap();
        cache.register(node_id, engine.remote_reads());

        (
            Self {
                scheduler,
                engine,
                done_rx,
                store,
            },
            batch_tx,
        )
    }

    fn wait_done(&self, expected: usize) -> Vec<CompletedTxn> {
        let mut done = Vec::with_capacity(expected);
        while done.len() < expected {
            done.push(
                self.done_rx
                    .recv_timeout(Duration::from_secs(10))
                    .expect("transaction completed"),
            );
        }
        done
    }

    /// The upstream batch channel must be closed first.
    fn shutdown(self) {
        self.scheduler.join();
        self.engine.stop();
    }
}

fn start_sequencer(
    info: Arc<ClusterInfo>,
    batch_tx: Sender<TransactionBatch>,
) -> Sequencer {
    let (_raft_tx, raft_rx) = bounded(16);
    Sequencer::start(
        SequencerConfig {
            node_id: 1,
            voters: vec![1],
            batch_interval: Duration::from_millis(10),
            snapshot_frequency: 0,
        },
        MemLogStore::with_voters(vec![1]),
        Arc::new(NoPeers),
        Arc::new(StoreSnapshotHandler::new(Arc::new(MemStore::new()))),
        Arc::new(LocalClusterInfo::new(info, 1).unwrap()),
        batch_tx,
        raft_rx,
    )
    .unwrap()
}

/// A complete single-node pipeline.
struct Node {
    sequencer: Sequencer,
    replica: Replica,
}

impl Node {
    fn start() -> Self {
        let info = single_node_cluster();
        let cache = RoutingCache::default();
        let seed = vec![
            (b"narf".to_vec(), b"narf_value".to_vec()),
            (b"moep".to_vec(), b"moep_value".to_vec()),
        ];
        let (replica, batch_tx) = Replica::start(info.clone(), 1, &cache, &seed);
        let sequencer = start_sequencer(info, batch_tx);
        Self { sequencer, replica }
    }

    fn run_to_completion(self, txns: Vec<Transaction>) -> (Vec<CompletedTxn>, MemStore) {
        let expected = txns.len();
        for txn in txns {
            self.sequencer.submit(txn).unwrap();
        }
        let done = self.replica.wait_done(expected);
        self.sequencer.stop();
        let store = self.replica.store.clone();
        self.replica.shutdown();
        (done, store)
    }
}

fn workload() -> Vec<Transaction> {
    // Disjoint key sets: order across workers is free, the final state is
    // not.
    let mut first = Transaction::new(TransactionId::new(), APPEND_MARK);
    first.add_read_write_key(b"narf".to_vec());
    first.add_arg(b"narf".to_vec());
    let mut second = Transaction::new(TransactionId::new(), APPEND_MARK);
    second.add_read_write_key(b"moep".to_vec());
    second.add_arg(b"moep".to_vec());
    vec![first, second]
}

#[test]
fn transactions_flow_from_submission_to_committed_state() {
    let txns = workload();
    let ids: Vec<TransactionId> = txns.iter().map(|t| t.id).collect();
    let (done, store) = Node::start().run_to_completion(txns);

    let mut done_ids: Vec<TransactionId> = done.iter().map(|d| d.txn.id).collect();
    done_ids.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(done_ids, expected);
    assert!(done.iter().all(|d| d.error.is_none()));

    assert_eq!(store.value(b"narf"), Some(b"narf_value!".to_vec()));
    assert_eq!(store.value(b"moep"), Some(b"moep_value!".to_vec()));
}

#[test]
fn participant_sets_are_stamped_before_ordering() {
    let txns = workload();
    let (done, _) = Node::start().run_to_completion(txns);
    for completed in done {
        assert_eq!(completed.txn.writer_nodes, vec![1]);
        assert_eq!(completed.txn.reader_nodes, vec![1]);
    }
}

#[test]
fn replicas_with_disjoint_partitions_converge_bitwise() {
    let info = two_node_cluster();
    let node1_keys = keys_owned_by(&info, 1, 2);
    let node2_keys = keys_owned_by(&info, 2, 2);

    // Each replica holds only the partitions it owns; values for the other
    // node's keys can only arrive through the remote-read rendezvous.
    let cache = RoutingCache::default();
    let (replica1, batch_tx1) = Replica::start(info.clone(), 1, &cache, &seed_pairs(&node1_keys));
    let (replica2, batch_tx2) = Replica::start(info.clone(), 2, &cache, &seed_pairs(&node2_keys));

    // One replicated log; both replicas observe the same delivered order.
    let (batch_tx, batch_rx) = bounded(16);
    let sequencer = start_sequencer(info.clone(), batch_tx);
    let fan_out = std::thread::spawn(move || {
        for batch in batch_rx.iter() {
            batch_tx1.send(batch.clone()).unwrap();
            batch_tx2.send(batch).unwrap();
        }
    });

    // Every transaction spans both nodes, so both execute it as writers
    // and each depends on the other's local reads.
    let mut txns = Vec::new();
    for (a, b) in node1_keys.iter().zip(node2_keys.iter()) {
        let mut txn = Transaction::new(TransactionId::new(), APPEND_MARK);
        txn.add_read_write_key(a.clone());
        txn.add_read_write_key(b.clone());
        txn.add_arg(a.clone());
        txn.add_arg(b.clone());
        txns.push(txn);
    }
    let ids: Vec<TransactionId> = txns.iter().map(|t| t.id).collect();
    for txn in &txns {
        sequencer.submit(txn.clone()).unwrap();
    }

    let done1 = replica1.wait_done(txns.len());
    let done2 = replica2.wait_done(txns.len());
    for completed in done1.iter().chain(done2.iter()) {
        assert!(completed.error.is_none());
        assert_eq!(completed.txn.writer_nodes, vec![1, 2]);
        assert_eq!(completed.txn.reader_nodes, vec![1, 2]);
    }
    for done in [&done1, &done2] {
        let mut done_ids: Vec<TransactionId> = done.iter().map(|d| d.txn.id).collect();
        done_ids.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(done_ids, expected);
    }

    sequencer.stop();
    fan_out.join().unwrap();
    let store1 = replica1.store.clone();
    let store2 = replica2.store.clone();
    replica1.shutdown();
    replica2.shutdown();

    // Both replicas executed every transaction; their stores must agree
    // bitwise on every transaction key, including keys whose pre-image one
    // replica only ever saw through its peer's reads.
    assert_eq!(store1.dump(), store2.dump());
    for key in node1_keys.iter().chain(node2_keys.iter()) {
        let mut expected = key.clone();
        expected.extend_from_slice(b"_value!");
        assert_eq!(store1.value(key), Some(expected.clone()));
        assert_eq!(store2.value(key), Some(expected));
    }
}
