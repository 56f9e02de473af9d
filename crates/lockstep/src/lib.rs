//! Lockstep: deterministic distributed transaction processing.
//!
//! Client transactions are totally ordered through a replicated log and then
//! executed deterministically against a partitioned key-value store, so
//! every replica reaches the same state without two-phase commit. The
//! [`sequencer`] owns the ordering step; the [`execution`] engine owns the
//! deterministic apply step; [`remote_read`] is the rendezvous that
//! completes a transaction's read view across partitions.

include!(concat!(env!("OUT_DIR"), "/volo_gen.rs"));

pub mod cluster;
pub mod execution;
pub mod ids;
pub mod procedures;
pub mod raft_log;
pub mod remote_read;
pub mod rpc_service;
pub mod scheduler;
pub mod sequencer;
pub mod store;
pub mod transport;
pub mod txn;
