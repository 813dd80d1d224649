//! kubegraph - Kubernetes to Neo4j synchronizer
//!
//! Watches every supported resource kind and mirrors it into the graph.

use anyhow::Result;
use clap::{Parser, Subcommand};
use kubegraph::pipeline::KubeSource;
use kubegraph::{AppState, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kubegraph")]
#[command(about = "Mirror Kubernetes cluster state into a Neo4j graph")]
struct Cli {
    /// Path to the YAML config file (defaults to ./config.yaml when present)
    #[arg(short, long, global = true, env = "KUBEGRAPH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the cluster and keep the graph in sync until interrupted
    Run,

    /// Delete nodes left behind by previous instances of this cluster name
    Cleanup,

    /// Delete Event nodes older than the retention window
    PruneEvents,

    /// Print node counts per kind for this instance
    Counts,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kubegraph=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_yaml_and_env(cli.config.as_deref())?;
    let state = AppState::new(config).await?;

    match cli.command {
        Commands::Run => run(state).await,
        Commands::Cleanup => {
            let report = state.cleanup().await?;
            tracing::info!(
                "Cleanup complete: {} cluster nodes, {} resources, {} duplicates removed",
                report.clusters,
                report.resources,
                report.duplicates
            );
            Ok(())
        }
        Commands::PruneEvents => {
            if !state.sweeper().is_enabled() {
                tracing::info!("Event retention is disabled, nothing to prune");
                return Ok(());
            }
            let deleted = state.prune_events().await?;
            tracing::info!("Pruned {} expired events", deleted);
            Ok(())
        }
        Commands::Counts => {
            for count in state.counts().await? {
                println!("{:<28} {}", count.kind, count.count);
            }
            Ok(())
        }
    }
}

async fn run(state: AppState) -> Result<()> {
    let source = Arc::new(KubeSource::try_default().await?);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    state.run(source, cancel).await
}

/// Resolves on Ctrl-C or, on unix, SIGTERM (pod termination).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
