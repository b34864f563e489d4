//! Cooperative task scheduler.
//!
//! One tokio loop per configured task instance: sleep the period, then run
//! the task with `deadline = now + soft_timeout`. A tick that errors is
//! logged and retried at the next period; nothing cross-task cascades.

use crate::tasks::{self, Task, TaskContext, TaskOutcome};
use archivist_core::config::TaskConfig;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Spawns and owns the background task loops.
pub struct Scheduler {
    ctx: TaskContext,
}

impl Scheduler {
    pub fn new(ctx: TaskContext) -> Self {
        Self { ctx }
    }

    /// Spawn a loop per configured task instance.
    pub fn spawn_all(&self, configs: &[TaskConfig]) -> Vec<JoinHandle<()>> {
        configs
            .iter()
            .map(|config| {
                let task = tasks::build(config);
                let ctx = self.ctx.clone();
                let every = config.every().as_std();
                let soft_timeout = config.soft_timeout().as_duration();
                tracing::info!(
                    task = %config.task_name(),
                    kind = %config.kind(),
                    every = %config.every(),
                    soft_timeout = %config.soft_timeout(),
                    "scheduling background task"
                );
                tokio::spawn(run_loop(ctx, task, every, soft_timeout))
            })
            .collect()
    }
}

async fn run_loop(
    ctx: TaskContext,
    task: Box<dyn Task>,
    every: std::time::Duration,
    soft_timeout: time::Duration,
) {
    loop {
        tokio::time::sleep(every).await;

        let started = OffsetDateTime::now_utc();
        let deadline = started + soft_timeout;
        match task.run(&ctx, deadline).await {
            Ok(TaskOutcome::Completed) => {
                tracing::debug!(
                    task = %task.name(),
                    elapsed = %(OffsetDateTime::now_utc() - started),
                    "task tick completed"
                );
            }
            Ok(TaskOutcome::DeadlineExceeded) => {
                tracing::warn!(
                    task = %task.name(),
                    soft_timeout = %soft_timeout,
                    "task hit its soft timeout, resuming next tick"
                );
            }
            Err(e) => {
                tracing::error!(task = %task.name(), error = %e, "task tick failed");
            }
        }
    }
}
