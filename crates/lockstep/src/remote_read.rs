//! Rendezvous for remote reads.
//!
//! Every reader participant of a transaction broadcasts its local reads to
//! the transaction's writer nodes. On each writer, the tracker accumulates
//! those deposits into a per-transaction execution environment and hands the
//! environment to the worker pool exactly once, when the expected number of
//! participations has arrived.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::ids::TransactionId;

/// One participation deposit: a peer's local reads for a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteReadRequest {
    pub txn_id: TransactionId,
    /// Number of declared keys the environment must resolve before the
    /// transaction may execute.
    pub total_num_locks: u32,
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
}

/// Reply to a deposit. `error` is empty on success and carries the
/// validation failure otherwise.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteReadResponse {
    pub error: String,
}

/// Per-transaction accumulator of resolved reads on an executing node.
#[derive(Clone, Debug)]
pub struct TxnExecEnvironment {
    pub txn_id: TransactionId,
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    pub total_num_locks: u32,
}

struct PendingEnv {
    env: TxnExecEnvironment,
    last_deposit: Instant,
}

/// Accumulates deposits and emits complete environments on the ready
/// channel. Environments nobody ever completes (stray or late broadcasts)
/// are dropped by the idle sweep.
pub struct RemoteReadTracker {
    envs: Mutex<HashMap<TransactionId, PendingEnv>>,
    ready_tx: Sender<TxnExecEnvironment>,
    idle_timeout: Duration,
}

impl RemoteReadTracker {
    pub fn new(ready_tx: Sender<TxnExecEnvironment>, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            envs: Mutex::new(HashMap::new()),
            ready_tx,
            idle_timeout,
        })
    }

    /// Fold one deposit into the transaction's environment. Returns a
    /// validation error string for malformed requests; transport concerns
    /// stay with the caller.
    pub fn deposit(&self, request: RemoteReadRequest) -> Result<(), String> {
        if request.keys.len() != request.values.len() {
            return Err(format!(
                "{} keys do not match {} values",
                request.keys.len(),
                request.values.len()
            ));
        }

        let complete = {
            let mut envs = self.envs.lock().expect("tracker lock poisoned");
            let pending = envs.entry(request.txn_id).or_insert_with(|| PendingEnv {
                env: TxnExecEnvironment {
                    txn_id: request.txn_id,
                    keys: Vec::new(),
                    values: Vec::new(),
                    total_num_locks: request.total_num_locks,
                },
                last_deposit: Instant::now(),
            });
            if pending.env.total_num_locks != request.total_num_locks {
                return Err(format!(
                    "conflicting lock totals for {}: {} then {}",
                    request.txn_id, pending.env.total_num_locks, request.total_num_locks
                ));
            }
            pending.env.keys.extend(request.keys);
            pending.env.values.extend(request.values);
            pending.last_deposit = Instant::now();

            if pending.env.keys.len() as u32 >= pending.env.total_num_locks {
                envs.remove(&request.txn_id).map(|p| p.env)
            } else {
                None
            }
        };

        if let Some(env) = complete {
            debug!(txn_id = %env.txn_id, locks = env.total_num_locks, "environment complete");
            if self.ready_tx.send(env).is_err() {
                return Err("execution engine stopped".to_string());
            }
        }
        Ok(())
    }

    /// Drop environments that have seen no deposit for the idle timeout.
    /// Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let mut envs = self.envs.lock().expect("tracker lock poisoned");
        let before = envs.len();
        envs.retain(|txn_id, pending| {
            let keep = pending.last_deposit.elapsed() < self.idle_timeout;
            if !keep {
                warn!(%txn_id, "dropping idle incomplete environment");
            }
            keep
        });
        before - envs.len()
    }

    /// Number of incomplete environments currently held.
    pub fn pending_len(&self) -> usize {
        self.envs.lock().expect("tracker lock poisoned").len()
    }

    /// Run the idle sweep until `stop_rx` closes.
    pub fn run_gc(self: Arc<Self>, stop_rx: Receiver<()>) {
        let interval = self.idle_timeout.max(Duration::from_millis(100)) / 2;
        loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    self.sweep_idle();
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn request(
        txn_id: TransactionId,
        total: u32,
        pairs: &[(&[u8], &[u8])],
    ) -> RemoteReadRequest {
        RemoteReadRequest {
            txn_id,
            total_num_locks: total,
            keys: pairs.iter().map(|(k, _)| k.to_vec()).collect(),
            values: pairs.iter().map(|(_, v)| v.to_vec()).collect(),
        }
    }

    #[test]
    fn environment_emitted_once_complete() {
        let (ready_tx, ready_rx) = bounded(4);
        let tracker = RemoteReadTracker::new(ready_tx, Duration::from_secs(30));
        let id = TransactionId::new();

        tracker
            .deposit(request(id, 2, &[(b"moep", b"moep_value")]))
            .unwrap();
        assert!(ready_rx.is_empty());

        tracker
            .deposit(request(id, 2, &[(b"narf", b"narf_value")]))
            .unwrap();
        let env = ready_rx.recv().unwrap();
        assert_eq!(env.txn_id, id);
        assert_eq!(env.keys, vec![b"moep".to_vec(), b"narf".to_vec()]);
        assert_eq!(
            env.values,
            vec![b"moep_value".to_vec(), b"narf_value".to_vec()]
        );
        assert_eq!(env.keys.len() as u32, env.total_num_locks);
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn zero_lock_environment_completes_immediately() {
        let (ready_tx, ready_rx) = bounded(4);
        let tracker = RemoteReadTracker::new(ready_tx, Duration::from_secs(30));
        let id = TransactionId::new();

        tracker.deposit(request(id, 0, &[])).unwrap();
        let env = ready_rx.recv().unwrap();
        assert_eq!(env.total_num_locks, 0);
        assert!(env.keys.is_empty());
    }

    #[test]
    fn mismatched_key_value_lengths_rejected() {
        let (ready_tx, _ready_rx) = bounded(4);
        let tracker = RemoteReadTracker::new(ready_tx, Duration::from_secs(30));
        let err = tracker
            .deposit(RemoteReadRequest {
                txn_id: TransactionId::new(),
                total_num_locks: 2,
                keys: vec![b"narf".to_vec()],
                values: vec![],
            })
            .unwrap_err();
        assert!(err.contains("do not match"));
    }

    #[test]
    fn conflicting_totals_rejected() {
        let (ready_tx, _ready_rx) = bounded(4);
        let tracker = RemoteReadTracker::new(ready_tx, Duration::from_secs(30));
        let id = TransactionId::new();
        tracker
            .deposit(request(id, 3, &[(b"a", b"1")]))
            .unwrap();
        let err = tracker.deposit(request(id, 2, &[(b"b", b"2")])).unwrap_err();
        assert!(err.contains("conflicting lock totals"));
    }

    #[test]
    fn idle_sweep_drops_stale_environments() {
        let (ready_tx, _ready_rx) = bounded(4);
        let tracker = RemoteReadTracker::new(ready_tx, Duration::from_millis(10));
        tracker
            .deposit(request(TransactionId::new(), 5, &[(b"a", b"1")]))
            .unwrap();
        assert_eq!(tracker.pending_len(), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(tracker.sweep_idle(), 1);
        assert_eq!(tracker.pending_len(), 0);
    }
}
