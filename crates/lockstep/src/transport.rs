//! Peer connections: cached gRPC clients for remote reads and raft traffic.
//!
//! The worker and sequencer threads speak blocking trait interfaces; the
//! gRPC-backed implementations bridge onto the shared tokio runtime. Tests
//! substitute in-process fakes behind the same traits.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context};
use protobuf::Message as PbMessage;
use raft::eraftpb::{Message, MessageType};
use tracing::warn;

use crate::cluster::{ClusterInfoProvider, NodeId};
use crate::remote_read::{RemoteReadRequest, RemoteReadResponse};
use crate::txn::to_rpc_txn_id;
use crate::volo_gen::lockstep::rpc;

/// Client half of the remote-read rendezvous.
pub trait RemoteReadClient: Send + Sync {
    fn remote_read(&self, request: RemoteReadRequest) -> anyhow::Result<RemoteReadResponse>;
}

/// Outcome of one fan-out of raft messages.
#[derive(Default)]
pub struct SendReport {
    /// Messages that could not be delivered.
    pub failed: Vec<Message>,
    /// Peers that acknowledged a snapshot message.
    pub succeeded_snapshots: Vec<NodeId>,
}

impl SendReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delivers raft messages to their destination peers.
pub trait RaftMessageClient: Send + Sync {
    fn send_messages(&self, messages: Vec<Message>) -> SendReport;
}

/// Hands out per-peer clients; lookups after the first are cached.
pub trait ConnectionCache: Send + Sync {
    fn remote_read_client(&self, node_id: NodeId) -> anyhow::Result<Arc<dyn RemoteReadClient>>;
    fn raft_client(&self, node_id: NodeId) -> anyhow::Result<Arc<dyn RaftMessageClient>>;
    fn close(&self);
}

/// gRPC-backed [`ConnectionCache`]. Peer addresses come from the cluster
/// topology snapshot; clients are built lazily and kept for the life of the
/// cache.
pub struct GrpcConnectionCache {
    cluster: Arc<dyn ClusterInfoProvider>,
    handle: tokio::runtime::Handle,
    rpc_timeout: Duration,
    clients: RwLock<HashMap<NodeId, rpc::LockstepRpcClient>>,
}

impl GrpcConnectionCache {
    pub fn new(
        cluster: Arc<dyn ClusterInfoProvider>,
        handle: tokio::runtime::Handle,
        rpc_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            handle,
            rpc_timeout: rpc_timeout.max(Duration::from_millis(1)),
            clients: RwLock::new(HashMap::new()),
        })
    }

    fn client_for(&self, node_id: NodeId) -> anyhow::Result<rpc::LockstepRpcClient> {
        if let Some(client) = self
            .clients
            .read()
            .expect("connection cache lock poisoned")
            .get(&node_id)
        {
            return Ok(client.clone());
        }

        let address = self
            .cluster
            .get_address_for(node_id)
            .ok_or_else(|| anyhow!("no address for node {node_id}"))?;
        let socket: SocketAddr = address
            .to_socket_addrs()
            .with_context(|| format!("resolve peer address {address}"))?
            .next()
            .ok_or_else(|| anyhow!("peer address {address} resolved to nothing"))?;
        let client = rpc::LockstepRpcClientBuilder::new("lockstep.rpc.LockstepRpc")
            .address(volo::net::Address::from(socket))
            .build();

        let mut clients = self
            .clients
            .write()
            .expect("connection cache lock poisoned");
        Ok(clients.entry(node_id).or_insert(client).clone())
    }
}

impl ConnectionCache for GrpcConnectionCache {
    fn remote_read_client(&self, node_id: NodeId) -> anyhow::Result<Arc<dyn RemoteReadClient>> {
        Ok(Arc::new(GrpcPeerClient {
            client: self.client_for(node_id)?,
            handle: self.handle.clone(),
            rpc_timeout: self.rpc_timeout,
            node_id,
        }))
    }

    fn raft_client(&self, node_id: NodeId) -> anyhow::Result<Arc<dyn RaftMessageClient>> {
        Ok(Arc::new(GrpcPeerClient {
            client: self.client_for(node_id)?,
            handle: self.handle.clone(),
            rpc_timeout: self.rpc_timeout,
            node_id,
        }))
    }

    fn close(&self) {
        self.clients
            .write()
            .expect("connection cache lock poisoned")
            .clear();
    }
}

/// One peer's client, shared by the remote-read and raft paths.
///
/// Calls block the invoking thread; callers are the dedicated worker and
/// sequencer threads, never the runtime itself.
struct GrpcPeerClient {
    client: rpc::LockstepRpcClient,
    handle: tokio::runtime::Handle,
    rpc_timeout: Duration,
    node_id: NodeId,
}

impl GrpcPeerClient {
    fn send_one(&self, message: &Message) -> anyhow::Result<()> {
        let bytes = message
            .write_to_bytes()
            .context("serialize raft message")?;
        let request = rpc::RaftMessageRequest {
            message: bytes.into(),
        };
        let client = self.client.clone();
        let timeout = self.rpc_timeout;
        self.handle
            .block_on(async move {
                tokio::time::timeout(timeout, client.raft_message(request)).await
            })
            .map_err(|_| anyhow!("raft message to node {} timed out", self.node_id))?
            .map_err(|err| anyhow!("raft message to node {} failed: {err}", self.node_id))?;
        Ok(())
    }
}

impl RemoteReadClient for GrpcPeerClient {
    fn remote_read(&self, request: RemoteReadRequest) -> anyhow::Result<RemoteReadResponse> {
        let wire = rpc::RemoteReadRequest {
            txn_id: Some(to_rpc_txn_id(request.txn_id)),
            total_num_locks: request.total_num_locks,
            keys: request.keys.into_iter().map(Into::into).collect(),
            values: request.values.into_iter().map(Into::into).collect(),
        };
        let client = self.client.clone();
        let timeout = self.rpc_timeout;
        let response = self
            .handle
            .block_on(async move {
                tokio::time::timeout(timeout, client.remote_read(wire)).await
            })
            .map_err(|_| anyhow!("remote read to node {} timed out", self.node_id))?
            .map_err(|err| anyhow!("remote read to node {} failed: {err}", self.node_id))?
            .into_inner();
        Ok(RemoteReadResponse {
            error: response.error.to_string(),
        })
    }
}

impl RaftMessageClient for GrpcPeerClient {
    fn send_messages(&self, messages: Vec<Message>) -> SendReport {
        let mut report = SendReport::default();
        for message in messages {
            let is_snapshot = message.get_msg_type() == MessageType::MsgSnapshot;
            match self.send_one(&message) {
                Ok(()) => {
                    if is_snapshot {
                        report.succeeded_snapshots.push(message.get_to());
                    }
                }
                Err(err) => {
                    warn!(to = message.get_to(), error = %err, "raft send failed");
                    report.failed.push(message);
                }
            }
        }
        report
    }
}

/// Fans raft messages out to per-destination clients from the cache.
pub struct CachedRaftMessageClient {
    cache: Arc<dyn ConnectionCache>,
}

impl CachedRaftMessageClient {
    pub fn new(cache: Arc<dyn ConnectionCache>) -> Self {
        Self { cache }
    }
}

impl RaftMessageClient for CachedRaftMessageClient {
    fn send_messages(&self, messages: Vec<Message>) -> SendReport {
        let mut report = SendReport::default();
        let mut by_peer: HashMap<NodeId, Vec<Message>> = HashMap::new();
        for message in messages {
            by_peer.entry(message.get_to()).or_default().push(message);
        }
        for (node_id, batch) in by_peer {
            match self.cache.raft_client(node_id) {
                Ok(client) => {
                    let peer_report = client.send_messages(batch);
                    report.failed.extend(peer_report.failed);
                    report
                        .succeeded_snapshots
                        .extend(peer_report.succeeded_snapshots);
                }
                Err(err) => {
                    warn!(node_id, error = %err, "no raft client for peer");
                    report.failed.extend(batch);
                }
            }
        }
        report
    }
}
