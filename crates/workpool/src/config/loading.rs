use std::path::Path;

use crate::error::PoolError;
use crate::task::Task;

use super::types::{default_name_prefix, default_workers, PoolConfig};

impl PoolConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, PoolError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// A config with `workers` workers and defaults for everything else.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// The init task to run on each spawned worker, if configured.
    pub fn init_task(&self) -> Option<Task> {
        self.init_task.as_ref().map(|init| init.to_task())
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// - `WORKPOOL_WORKERS` -> `workers`
    /// - `WORKPOOL_NAME_PREFIX` -> `name_prefix`
    /// - `WORKPOOL_THREAD_STACK_SIZE` -> `thread_stack_size`
    ///
    /// Values that do not parse are ignored.
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WORKPOOL_WORKERS") {
            if let Ok(workers) = v.parse::<usize>() {
                self.workers = workers;
            }
        }
        if let Ok(v) = std::env::var("WORKPOOL_NAME_PREFIX") {
            self.name_prefix = v;
        }
        if let Ok(v) = std::env::var("WORKPOOL_THREAD_STACK_SIZE") {
            if let Ok(size) = v.parse::<usize>() {
                self.thread_stack_size = Some(size);
            }
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            name_prefix: default_name_prefix(),
            thread_stack_size: None,
            init_task: None,
        }
    }
}
