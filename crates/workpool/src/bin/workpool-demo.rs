//! workpool-demo: spins up a thread-backed worker pool and pushes a batch
//! of sample tasks through it.
//!
//! # Usage
//!
//! ```bash
//! # One worker per CPU, defaults for everything else
//! workpool-demo
//!
//! # Four workers, 32 tasks, settings from a file
//! workpool-demo --config workpool.toml --workers 4 --tasks 32
//!
//! # Via environment variables
//! WORKPOOL_WORKERS=2 RUST_LOG=debug workpool-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use stupid_workpool::{PoolConfig, Task, TaskExecutor, ThreadSpawner, TransferBuffer, WorkerPool};

/// Run sample tasks on a pool of worker threads.
#[derive(Parser, Debug)]
#[command(name = "workpool-demo", version, about)]
struct Cli {
    /// Path to a `workpool.toml` file.
    #[arg(long, env = "WORKPOOL_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Number of workers, overriding the config.
    #[arg(long)]
    workers: Option<usize>,

    /// Number of `addNumbers` tasks to schedule.
    #[arg(long, default_value_t = 16)]
    tasks: u32,

    /// Milliseconds each `waitAndPing` task sleeps.
    #[arg(long, default_value_t = 50)]
    wait_ms: u64,
}

impl Cli {
    fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let mut config = match &self.config {
            Some(path) => PoolConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PoolConfig::from_toml("")?,
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
            config.validate()?;
        }
        Ok(config)
    }
}

fn sample_executor() -> Arc<TaskExecutor> {
    Arc::new(
        TaskExecutor::new("samples")
            .sync_task("simpleTask", |_| Ok(json!(true).into()))
            .sync_task("addNumbers", |call| {
                let (a, b): (i64, i64) = (call.arg(0)?, call.arg(1)?);
                Ok(json!(a + b).into())
            })
            .sync_task("numberTransfer", |call| {
                let numbers = call.buffer(0)?.to_u32s();
                Ok(json!(numbers.iter().map(|&n| u64::from(n)).sum::<u64>()).into())
            })
            .task("waitAndPing", |call| async move {
                let ms: u64 = call.arg(0)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!("pong").into())
            }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting workpool-demo");

    let config = cli.pool_config()?;
    let spawner = ThreadSpawner::from_config(&config, |_| vec![sample_executor()]);
    let pool = WorkerPool::spawn(&config, &spawner).await?;

    // A batch that outnumbers the workers, so most of it queues.
    let sums = pool.schedule_tasks(
        (0..cli.tasks).map(|i| Task::new("addNumbers", vec![json!(i), json!(i)], vec![])),
    );

    let numbers: Vec<u32> = (1..=100).collect();
    let buffer = TransferBuffer::from_u32s(&numbers);
    let transfer =
        pool.schedule_task(pool.make_task("numberTransfer", vec![], vec![buffer.clone()]));
    tracing::info!(sender_len = buffer.len(), "buffer handed to the pool");

    let pings: Vec<_> = (0..config.workers * 2)
        .map(|_| pool.schedule_task(Task::new("waitAndPing", vec![json!(cli.wait_ms)], vec![])))
        .collect();
    let cancelled = pool.cancel_pending("waitAndPing");
    tracing::info!(cancelled, pending = pool.pending_count(), "cancelled queued pings");

    let sums = sums.await?;
    tracing::info!(completed = sums.len(), "addNumbers batch done");

    let total = transfer.await?;
    tracing::info!(sum = ?total.data(), "numberTransfer done");

    for ping in pings {
        let outcome = ping.await?;
        tracing::debug!(cancelled = outcome.is_cancelled(), "ping settled");
    }

    let stats = serde_json::to_string(&pool.stats())?;
    tracing::info!(%stats, running = pool.running(), "pool stats");

    pool.kill_workers();
    tracing::info!("workpool-demo exited cleanly");
    Ok(())
}
