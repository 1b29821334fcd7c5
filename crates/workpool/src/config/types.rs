use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::Task;

/// Smallest worker thread stack accepted by validation.
pub(crate) const MIN_THREAD_STACK_SIZE: usize = 64 * 1024;

// ── Top-level config ────────────────────────────────────────────────

/// Configuration for spawning a [`WorkerPool`](crate::pool::WorkerPool).
///
/// Parsed from `workpool.toml` with support for environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers to spawn. Defaults to the number of logical CPUs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Worker names are `{name_prefix}-{index}`.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Stack size for worker threads, in bytes. `None` keeps the platform default.
    #[serde(default)]
    pub thread_stack_size: Option<usize>,

    /// Task run on every worker as it joins the pool.
    #[serde(default)]
    pub init_task: Option<InitTaskConfig>,
}

pub(crate) fn default_workers() -> usize {
    num_cpus::get()
}

pub(crate) fn default_name_prefix() -> String {
    "workpool".into()
}

// ── Section configs ─────────────────────────────────────────────────

/// `[init_task]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitTaskConfig {
    pub name: String,

    #[serde(default)]
    pub args: Vec<Value>,
}

impl InitTaskConfig {
    pub fn to_task(&self) -> Task {
        Task::new(self.name.clone(), self.args.clone(), Vec::new())
    }
}
