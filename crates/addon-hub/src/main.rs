//! Hub controller manager binary

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use addon_common::kube_utils::create_client;
use addon_hub::run_controller_manager;

/// Start the addon manager controllers on the hub cluster
#[derive(Parser, Debug)]
#[command(name = "manager", version, about)]
struct Cli {
    /// Path to the hub kubeconfig; in-cluster configuration when omitted
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kube=info,tower=warn,hyper=warn")),
        )
        .init();

    let cli = Cli::parse();
    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        signal_token.cancel();
    });

    run_controller_manager(client, shutdown).await?;
    Ok(())
}
