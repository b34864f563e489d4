//! Background-only runner.
//!
//! Hosts the scheduler without the HTTP surface, for deployments where
//! the ingest server runs in a separate process (that server must set
//! `background.enabled = false`). Exit codes: 0 success, 2 configuration
//! error, 3 database unreachable, 4 task kind unknown.

use archivist_server::bootstrap::{self, BootstrapError};
use archivist_server::scheduler::Scheduler;
use archivist_server::tasks::{self, TaskContext, TaskOutcome};
use clap::Parser;
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const EXIT_CONFIG: i32 = 2;
const EXIT_DATABASE: i32 = 3;
const EXIT_UNKNOWN_TASK: i32 = 4;

/// Archivist background task runner
#[derive(Parser, Debug)]
#[command(name = "archivist-background")]
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

    /// Run the named task instance once and exit instead of scheduling.
    #[arg(long)]
    once: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let config = match bootstrap::load_config(&args.config) {
        Ok(config) => config,
        Err(BootstrapError::Config(reason)) => {
            // A mistyped task kind surfaces as an enum variant error; the
            // operator gets the dedicated exit code for it.
            if reason.contains("unknown variant") {
                tracing::error!(error = %reason, "unknown task kind in background configuration");
                return EXIT_UNKNOWN_TASK;
            }
            tracing::error!(error = %reason, "configuration error");
            return EXIT_CONFIG;
        }
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return EXIT_CONFIG;
        }
    };

    let state = match bootstrap::build_state(config).await {
        Ok(state) => state,
        Err(BootstrapError::Database(reason)) => {
            tracing::error!(error = %reason, "database unreachable");
            return EXIT_DATABASE;
        }
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return EXIT_CONFIG;
        }
    };

    let ctx = TaskContext::new(state.clone());

    if let Some(task_name) = args.once {
        let Some(task_config) = state
            .config
            .background
            .tasks
            .iter()
            .find(|t| t.task_name() == task_name)
        else {
            tracing::error!(task = %task_name, "no such task instance in background configuration");
            return EXIT_UNKNOWN_TASK;
        };

        let task = tasks::build(task_config);
        let deadline = OffsetDateTime::now_utc() + task_config.soft_timeout().as_duration();
        return match task.run(&ctx, deadline).await {
            Ok(TaskOutcome::Completed) => {
                tracing::info!(task = %task_name, "task completed");
                0
            }
            Ok(TaskOutcome::DeadlineExceeded) => {
                tracing::warn!(task = %task_name, "task hit its soft timeout");
                0
            }
            Err(e) => {
                tracing::error!(task = %task_name, error = %e, "task failed");
                1
            }
        };
    }

    let scheduler = Scheduler::new(ctx);
    let handles = scheduler.spawn_all(&state.config.background.tasks);
    if handles.is_empty() {
        tracing::warn!("no background tasks configured, exiting");
        return 0;
    }
    tracing::info!(tasks = handles.len(), "background scheduler running");

    // Run until interrupted.
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("interrupted, shutting down");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            1
        }
    }
}
