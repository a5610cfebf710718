use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fam_common::config::FamConfig;
use fam_ms::rpc_server::MsDispatcher;
use fam_ms::{MemoryServer, MsConfig};
use fam_rdma::provider::LoopbackProvider;
use tracing::info;

#[derive(Parser)]
#[command(version, about = "Memory Server daemon")]
struct Cli {
    /// Path to the TOML config file; falls back to built-in defaults if absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// This server's node id within the memsrv_list.
    #[arg(long, default_value_t = 0)]
    node_id: u64,

    /// Directory region files and ATL queues are stored under.
    #[arg(long, default_value = "./fam-ms-data")]
    data_dir: PathBuf,

    /// Number of ATL worker threads (queues) to run.
    #[arg(long, default_value_t = 4)]
    num_atomic_threads: u32,

    /// Address the admin/health HTTP surface binds to.
    #[arg(long, default_value = "127.0.0.1:8787")]
    admin_addr: SocketAddr,

    /// Address the internal MS RPC surface binds to.
    #[arg(long, default_value = "127.0.0.1:8788")]
    rpc_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FamConfig::from_file(path)?,
        None => FamConfig::default(),
    };
    info!(provider = %config.provider, node_id = cli.node_id, "starting fam-msd");

    // No real libfabric binding exists in this workspace; the loopback
    // provider backs the single-node dev deployment.
    let provider = Arc::new(LoopbackProvider::new());
    let server = Arc::new(MemoryServer::start(
        MsConfig {
            node_id: cli.node_id,
            data_dir: cli.data_dir,
            num_atomic_threads: cli.num_atomic_threads,
        },
        provider,
    )?);

    let dispatcher: Arc<dyn fam_rpc::Dispatcher> = Arc::new(MsDispatcher { server: server.clone() });
    let rpc_addr = cli.rpc_addr;
    let rpc_task = tokio::spawn(async move { fam_rpc::serve_grpc(rpc_addr, dispatcher).await });

    fam_ms::admin::serve(server, cli.admin_addr).await?;
    rpc_task.abort();
    Ok(())
}
