//! Archivist librarian server binary.

use anyhow::{Context, Result};
use archivist_server::scheduler::Scheduler;
use archivist_server::tasks::TaskContext;
use archivist_server::{bootstrap, create_router, metrics};
use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Archivist - a federated scientific-data librarian
#[derive(Parser, Debug)]
#[command(name = "archivistd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "ARCHIVIST_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("archivist v{}", env!("CARGO_PKG_VERSION"));

    let config = bootstrap::load_config(&args.config).context("failed to load configuration")?;

    metrics::register_metrics();

    let state = bootstrap::build_state(config)
        .await
        .context("failed to initialize")?;

    if state.config.background.enabled {
        let ctx = TaskContext::new(state.clone());
        let scheduler = Scheduler::new(ctx);
        // Dropping the handles detaches the loops; they run for the life
        // of the process.
        let handles = scheduler.spawn_all(&state.config.background.tasks);
        tracing::info!(tasks = handles.len(), "background scheduler started");
    } else {
        tracing::info!("background tasks disabled, running ingest only");
    }

    let app = create_router(state.clone());
    let addr: SocketAddr = state
        .config
        .server
        .bind
        .parse()
        .context("invalid bind address")?;

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
