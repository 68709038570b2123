// src/main.rs

mod assembler;
mod config;
mod error;
mod overlay;
mod pipeline;
mod segments;
#[cfg(test)]
mod testing;
mod types;
mod video_processor;

use anyhow::{Context, Result};
use clap::Parser;
use pipeline::{CancelFlag, Clock, SnippetGenerator, SnippetMetrics, SystemClock, TaskPlanner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::{Config, Task};
use video_processor::OpenCvProbe;

#[derive(Parser, Debug)]
#[command(name = "snippet-generator")]
#[command(about = "Cut time-bounded snippets out of segmented camera recordings")]
#[command(version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// JSON array of snippet tasks
    tasks: PathBuf,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("snippet_generator={}", level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse task file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;
    init_logging(&config.logging.level);

    info!("🎬 Snippet generator starting");
    info!(
        "✓ Configuration loaded: {:?} index, {} tracker, {} concurrent task(s)",
        config.segments.mode, config.overlay.tracker, config.tasks.max_concurrent
    );

    let tasks = load_tasks(&args.tasks)?;
    info!("Loaded {} task(s) from {}", tasks.len(), args.tasks.display());
    if tasks.is_empty() {
        warn!("Nothing to do");
        return Ok(());
    }

    let metrics = SnippetMetrics::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let timeout = config.tasks.timeout();
    let planner = Arc::new(TaskPlanner::new(config.tasks.clone()));
    let permits = Arc::new(Semaphore::new(config.tasks.max_concurrent));
    let generator = Arc::new(SnippetGenerator::new(
        config,
        Arc::new(OpenCvProbe),
        clock.clone(),
        metrics.clone(),
    ));

    let mut workers = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        let generator = generator.clone();
        let planner = planner.clone();
        let permits = permits.clone();
        let clock = clock.clone();

        workers.spawn(async move {
            let prepared = planner.prepare(task, clock.now());
            if let Some(delay) = prepared.delay {
                tokio::time::sleep(delay).await;
            }
            let Ok(permit) = permits.acquire_owned().await else {
                return;
            };
            run_task(index, generator, prepared.task, timeout, permit).await;
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Task worker aborted: {}", e);
        }
    }

    let summary = metrics.summary();
    info!(
        "📊 Final report: {} succeeded, {} failed, {} timed out in {:.1}s",
        summary.tasks_succeeded, summary.tasks_failed, summary.tasks_timed_out, summary.elapsed_secs
    );
    info!("{}", serde_json::to_string(&summary)?);

    Ok(())
}

/// Run one task on a blocking worker under the configured timeout. The
/// permit is held by the worker itself, so a timed-out task keeps its slot
/// until its decode loop has noticed the cancel flag and stopped.
async fn run_task(
    index: usize,
    generator: Arc<SnippetGenerator>,
    task: Task,
    timeout: Duration,
    permit: OwnedSemaphorePermit,
) {
    let output = task.output_file.clone();
    let metrics = generator.metrics().clone();
    let cancel = CancelFlag::new();
    let worker_cancel = cancel.clone();
    let mut work = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        generator
            .process_task(&task, &worker_cancel)
            .map(|report| report.frames_written())
    });

    match tokio::time::timeout(timeout, &mut work).await {
        Ok(Ok(Ok(frames))) => {
            info!("✓ Task {} done: {} frames -> {}", index, frames, output.display())
        }
        // Already logged with its category inside the task span
        Ok(Ok(Err(_))) => {}
        Ok(Err(e)) => error!("Task {} worker panicked: {}", index, e),
        Err(_) => {
            cancel.cancel();
            metrics.record_timeout();
            error!(
                "Task {} timed out after {}s ({})",
                index,
                timeout.as_secs(),
                output.display()
            );
            // Wait for the frame loop to stop so the report covers all work
            if let Err(e) = work.await {
                error!("Task {} worker panicked after timeout: {}", index, e);
            }
        }
    }
}
