use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fam_common::config::FamConfig;
use fam_mds::rpc_server::MdsDispatcher;
use fam_mds::MdsState;
use tracing::info;

#[derive(Parser)]
#[command(version, about = "Metadata Service daemon")]
struct Cli {
    /// Path to the TOML config file; falls back to built-in defaults if absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address the admin/health HTTP surface binds to.
    #[arg(long, default_value = "127.0.0.1:8789")]
    admin_addr: SocketAddr,

    /// Address the internal MDS RPC surface binds to.
    #[arg(long, default_value = "127.0.0.1:8790")]
    rpc_addr: SocketAddr,

    /// Upper bound on concurrently live region ids.
    #[arg(long, default_value_t = 1 << 16)]
    max_regions: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FamConfig::from_file(path)?,
        None => FamConfig::default(),
    };
    info!(provider = %config.provider, "starting fam-mdsd");

    let state = Arc::new(MdsState::new(cli.max_regions));
    let dispatcher: Arc<dyn fam_rpc::Dispatcher> = Arc::new(MdsDispatcher { state: state.clone() });

    let rpc_addr = cli.rpc_addr;
    let rpc_task = tokio::spawn(async move { fam_rpc::serve_grpc(rpc_addr, dispatcher).await });

    fam_mds::admin::serve(state, cli.admin_addr).await?;
    rpc_task.abort();
    Ok(())
}
