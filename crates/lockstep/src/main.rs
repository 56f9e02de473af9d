// Lockstep node binary entry point.
//
// Wires together the store, the sequencer with its replicated log, the
// scheduler bridge, the execution engine, and the gRPC server, then runs
// until interrupted.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;
use tracing::{error, info, warn};

use lockstep::cluster::{ClusterInfo, LocalClusterInfo};
use lockstep::execution::{Engine, EngineConfig};
use lockstep::procedures::init_stored_procedures;
use lockstep::raft_log::{MemLogStore, StoreSnapshotHandler};
use lockstep::rpc_service::LockstepRpcService;
use lockstep::scheduler::Scheduler;
use lockstep::sequencer::{Sequencer, SequencerConfig};
use lockstep::store::{DataStoreTxnProvider, FjallStore, MemStore};
use lockstep::transport::{CachedRaftMessageClient, ConnectionCache, GrpcConnectionCache};
use lockstep::volo_gen;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "lockstep")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Node(NodeArgs),
}

/// CLI options for running a node.
#[derive(Parser, Debug)]
struct NodeArgs {
    #[arg(long, env = "LOCKSTEP_NODE_ID")]
    node_id: u64,

    #[arg(long, env = "LOCKSTEP_LISTEN_GRPC")]
    listen_grpc: SocketAddr,

    /// Path to the TOML cluster-info file.
    #[arg(long, env = "LOCKSTEP_CLUSTER_INFO")]
    cluster_info: PathBuf,

    #[arg(long, env = "LOCKSTEP_DATA_DIR", default_value = "./lockstep-data")]
    data_dir: PathBuf,

    /// Keep the store in memory instead of on disk.
    #[arg(long, env = "LOCKSTEP_MEM_STORE", default_value_t = false)]
    mem_store: bool,

    /// Batch tick in milliseconds; the raft clock runs on the same cadence.
    #[arg(long, env = "LOCKSTEP_BATCH_INTERVAL_MS", default_value_t = 40)]
    batch_interval_ms: u64,

    /// Number of execution workers.
    #[arg(long, env = "LOCKSTEP_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Cut a log snapshot every this many applied entries (0 disables).
    #[arg(long, env = "LOCKSTEP_SNAPSHOT_FREQUENCY", default_value_t = 1000)]
    snapshot_frequency: u64,

    /// Per-call timeout for peer RPCs in milliseconds.
    #[arg(long, env = "LOCKSTEP_RPC_TIMEOUT_MS", default_value_t = 5000)]
    rpc_timeout_ms: u64,

    /// Idle timeout before incomplete remote-read environments are swept.
    #[arg(long, env = "LOCKSTEP_ENV_IDLE_TIMEOUT_MS", default_value_t = 30_000)]
    env_idle_timeout_ms: u64,
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,h2=warn,hyper=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

/// Initialize storage, sequencing, execution, and the gRPC server, and run
/// until ctrl-c.
async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let info = Arc::new(ClusterInfo::load(&args.cluster_info)?);
    let cluster = Arc::new(LocalClusterInfo::new(info.clone(), args.node_id)?);

    let provider: Arc<dyn DataStoreTxnProvider> = if args.mem_store {
        Arc::new(MemStore::new())
    } else {
        std::fs::create_dir_all(&args.data_dir).context("create data dir")?;
        Arc::new(FjallStore::open(args.data_dir.join("storage"))?)
    };

    let conn_cache = GrpcConnectionCache::new(
        cluster.clone(),
        tokio::runtime::Handle::current(),
        Duration::from_millis(args.rpc_timeout_ms),
    );
    let cache_dyn: Arc<dyn ConnectionCache> = conn_cache.clone();
    let raft_client = Arc::new(CachedRaftMessageClient::new(cache_dyn.clone()));

    let (batch_tx, batch_rx) = bounded(64);
    let (scheduled_tx, scheduled_rx) = bounded(128);
    let (done_tx, done_rx) = bounded(128);
    let (raft_inbox_tx, raft_inbox_rx) = bounded(1024);

    let voters = info.primary_ids();
    let sequencer = Sequencer::start(
        SequencerConfig {
            node_id: args.node_id,
            voters: voters.clone(),
            batch_interval: Duration::from_millis(args.batch_interval_ms.max(1)),
            snapshot_frequency: args.snapshot_frequency,
        },
        MemLogStore::with_voters(voters),
        raft_client,
        Arc::new(StoreSnapshotHandler::new(provider.clone())),
        cluster.clone(),
        batch_tx,
        raft_inbox_rx,
    )?;
    let scheduler = Scheduler::start(batch_rx, scheduled_tx)?;
    let engine = Engine::start(
        EngineConfig {
            num_workers: args.workers,
            env_idle_timeout: Duration::from_millis(args.env_idle_timeout_ms.max(1)),
            procedures: init_stored_procedures(),
        },
        scheduled_rx,
        done_tx,
        provider.clone(),
        cache_dyn.clone(),
        cluster.clone(),
    )?;

    let grpc_addr = args.listen_grpc;
    tokio::spawn({
        let service = LockstepRpcService::new(engine.remote_reads(), raft_inbox_tx);
        async move {
            let svc = volo_gen::lockstep::rpc::LockstepRpcServer::new(service);
            let svc = volo_grpc::server::ServiceBuilder::new(svc).build::<
                volo_gen::lockstep::rpc::LockstepRpcRequestRecv,
                volo_gen::lockstep::rpc::LockstepRpcResponseSend,
            >();
            let result = volo_grpc::server::Server::new()
                .add_service(svc)
                .run(volo::net::Address::from(grpc_addr))
                .await;
            if let Err(err) = result {
                // Log server failures without crashing the node task.
                error!(error = ?err, "gRPC server failed");
            }
        }
    });

    // Acknowledge finished transactions off the done channel.
    let acknowledger = std::thread::Builder::new()
        .name("acknowledger".to_string())
        .spawn(move || {
            for done in done_rx.iter() {
                match done.error {
                    None => info!(txn_id = %done.txn.id, "transaction committed"),
                    Some(err) => {
                        warn!(txn_id = %done.txn.id, error = %err, "transaction failed")
                    }
                }
            }
        })
        .context("spawn acknowledger thread")?;

    info!(node_id = args.node_id, grpc = %grpc_addr, "node started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    sequencer.stop();
    scheduler.join();
    engine.stop();
    if acknowledger.join().is_err() {
        error!("acknowledger thread panicked");
    }
    cache_dyn.close();
    provider.close()?;
    Ok(())
}
