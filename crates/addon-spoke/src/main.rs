//! Spoke agent binary

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use addon_spoke::SpokeAgentOptions;

/// Start the addon agent controllers on a managed cluster
#[derive(Parser, Debug)]
#[command(name = "agent", version, about)]
struct Cli {
    /// Name of the managed cluster this agent runs on
    #[arg(long = "cluster-name")]
    cluster_name: String,

    /// The mount path of the hub kubeconfig in the container
    #[arg(long = "hub-kubeconfig", default_value = "/spoke/hub-kubeconfig")]
    hub_kubeconfig: PathBuf,

    /// Path to the local cluster kubeconfig; in-cluster configuration when
    /// omitted
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
    let options = SpokeAgentOptions {
        cluster_name: cli.cluster_name,
        hub_kubeconfig: cli.hub_kubeconfig,
        kubeconfig: cli.kubeconfig,
    };
    options.validate()?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        signal_token.cancel();
    });

    options.run(shutdown).await?;
    Ok(())
}
