use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fam_cis::coordinator::CisCoordinator;
use fam_cis::rpc_server::CisDispatcher;
use fam_common::config::FamConfig;
use fam_rpc::{DirectTransport, GrpcTransport, Transport};
use tracing::info;

#[derive(Parser)]
#[command(version, about = "Client Interface Service coordinator daemon")]
struct Cli {
    /// Path to the TOML config file; falls back to built-in defaults if absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory named backups are written under.
    #[arg(long, default_value = "./fam-cis-backups")]
    backup_dir: PathBuf,

    /// Address the admin/health HTTP surface binds to.
    #[arg(long, default_value = "127.0.0.1:8792")]
    admin_addr: SocketAddr,

    /// Address the client-facing `fam.Cis` RPC surface binds to.
    #[arg(long, default_value = "127.0.0.1:8791")]
    rpc_addr: SocketAddr,
}

fn dial(addr: &str, framework: &str) -> Arc<dyn Transport> {
    if framework == "direct" {
        Arc::new(DirectTransport::new(addr.to_string()))
    } else {
        Arc::new(GrpcTransport::new(addr.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FamConfig::from_file(path)?,
        None => FamConfig::default(),
    };
    info!(provider = %config.provider, framework = %config.rpc_framework_type, "starting fam-cisd");

    let metadata_servers = config.metadata_servers()?;
    let mds_entry = metadata_servers
        .first()
        .ok_or(fam_common::error::FamError::MemservListEmpty)?;
    let mds = dial(&format!("{}:{}", mds_entry.host, mds_entry.port), &config.metadata_interface_type);

    let mut memservers = HashMap::new();
    for entry in config.memservers()? {
        let transport = dial(&format!("{}:{}", entry.host, entry.port), &config.memsrv_interface_type);
        memservers.insert(entry.id, transport);
    }

    let coordinator = Arc::new(CisCoordinator::new(mds, memservers));
    let dispatcher: Arc<dyn fam_rpc::Dispatcher> = Arc::new(CisDispatcher {
        coordinator: coordinator.clone(),
        backup_dir: cli.backup_dir,
    });

    let rpc_addr = cli.rpc_addr;
    let framework = config.rpc_framework_type.clone();
    let rpc_task = tokio::spawn(async move {
        if framework == "direct" {
            fam_rpc::serve_direct(rpc_addr, dispatcher).await
        } else {
            fam_rpc::serve_grpc(rpc_addr, dispatcher).await
        }
    });

    fam_cis::admin::serve(coordinator, cli.admin_addr).await?;
    rpc_task.abort();
    Ok(())
}
