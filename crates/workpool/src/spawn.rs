//! Spawning workers on dedicated OS threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info_span, instrument, Instrument};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::registry::{TaskExecutor, TaskExecutorRegistry};
use crate::traits::WorkerSpawner;
use crate::transport::ChannelTransport;
use crate::worker::Worker;

/// Builds the executors for the worker with the given spawn index.
pub type ExecutorFactory = Arc<dyn Fn(usize) -> Vec<Arc<TaskExecutor>> + Send + Sync>;

/// Spawns each worker on its own OS thread running a current-thread tokio
/// runtime. The worker serves its executors until the pool side terminates
/// or drops its end of the channel, then the thread exits.
#[derive(Clone)]
pub struct ThreadSpawner {
    factory: ExecutorFactory,
    stack_size: Option<usize>,
    spawned: Arc<AtomicUsize>,
}

impl ThreadSpawner {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(usize) -> Vec<Arc<TaskExecutor>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            stack_size: None,
            spawned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawner that honours the config's thread settings.
    pub fn from_config<F>(config: &PoolConfig, factory: F) -> Self
    where
        F: Fn(usize) -> Vec<Arc<TaskExecutor>> + Send + Sync + 'static,
    {
        let spawner = Self::new(factory);
        match config.thread_stack_size {
            Some(size) => spawner.stack_size(size),
            None => spawner,
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Number of workers spawned so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WorkerSpawner for ThreadSpawner {
    /// Returns once the worker's executors are registered and it is ready
    /// to take requests.
    #[instrument(skip_all, fields(worker = %name))]
    async fn spawn(&self, name: &str) -> Result<Worker, PoolError> {
        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let executors = (self.factory)(index);
        let (pool_end, worker_end) = ChannelTransport::channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), PoolError>>();

        let mut builder = std::thread::Builder::new().name(name.to_string());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let span = info_span!("worker", name = %name);
        builder
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(PoolError::Spawn(e.to_string())));
                        return;
                    }
                };

                runtime.block_on(
                    async move {
                        let transport = Arc::new(ChannelTransport::connect(worker_end));
                        let registry = TaskExecutorRegistry::new(transport.clone());
                        for executor in executors {
                            if let Err(e) = registry.add_executor(executor) {
                                let _ = ready_tx.send(Err(e));
                                return;
                            }
                        }
                        let _ = ready_tx.send(Ok(()));

                        transport.closed().await;
                        debug!("pool hung up, worker exiting");
                    }
                    .instrument(span),
                );
            })
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| PoolError::Spawn("worker thread exited during startup".into()))??;

        debug!(index, "worker thread ready");
        Ok(Worker::new(name, ChannelTransport::connect(pool_end)))
    }
}
