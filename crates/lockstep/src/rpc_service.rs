//! gRPC service handlers: the server-side counterpart to `transport.rs`.
//!
//! `RemoteRead` deposits a peer's local reads into the execution engine's
//! rendezvous tracker; `RaftMessage` feeds peer raft traffic into the
//! sequencer's step channel. Validation failures travel in the response
//! body, transport failures as RPC status.

use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tracing::debug;

use crate::remote_read::{RemoteReadRequest, RemoteReadTracker};
use crate::txn::from_rpc_txn_id_required;
use crate::volo_gen::lockstep::rpc;

/// gRPC service implementation for one node.
#[derive(Clone)]
pub struct LockstepRpcService {
    tracker: Arc<RemoteReadTracker>,
    raft_inbox: crossbeam_channel::Sender<Message>,
}

impl LockstepRpcService {
    pub fn new(
        tracker: Arc<RemoteReadTracker>,
        raft_inbox: crossbeam_channel::Sender<Message>,
    ) -> Self {
        Self {
            tracker,
            raft_inbox,
        }
    }
}

impl rpc::LockstepRpc for LockstepRpcService {
    /// Accept one participation deposit for a transaction.
    async fn remote_read(
        &self,
        req: volo_grpc::Request<rpc::RemoteReadRequest>,
    ) -> Result<volo_grpc::Response<rpc::RemoteReadResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        let txn_id = from_rpc_txn_id_required(req.txn_id)
            .map_err(|err| volo_grpc::Status::invalid_argument(err.to_string()))?;
        debug!(%txn_id, locks = req.total_num_locks, "remote read deposit");

        let request = RemoteReadRequest {
            txn_id,
            total_num_locks: req.total_num_locks,
            keys: req.keys.into_iter().map(|k| k.to_vec()).collect(),
            values: req.values.into_iter().map(|v| v.to_vec()).collect(),
        };
        let error = match self.tracker.deposit(request) {
            Ok(()) => String::new(),
            Err(error) => error,
        };
        Ok(volo_grpc::Response::new(rpc::RemoteReadResponse {
            error: error.into(),
        }))
    }

    /// Carry one serialized raft message from a peer into the sequencer.
    async fn raft_message(
        &self,
        req: volo_grpc::Request<rpc::RaftMessageRequest>,
    ) -> Result<volo_grpc::Response<rpc::RaftMessageResponse>, volo_grpc::Status> {
        let req = req.into_inner();
        let message = <Message as PbMessage>::parse_from_bytes(&req.message)
            .map_err(|err| volo_grpc::Status::invalid_argument(err.to_string()))?;
        self.raft_inbox
            .send(message)
            .map_err(|_| volo_grpc::Status::unavailable("sequencer stopped"))?;
        Ok(volo_grpc::Response::new(rpc::RaftMessageResponse {}))
    }
}
