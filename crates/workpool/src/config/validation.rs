use super::types::{PoolConfig, MIN_THREAD_STACK_SIZE};
use crate::error::PoolError;

impl PoolConfig {
    /// Validate the config.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.workers == 0 {
            return Err(PoolError::Config("workers must be at least 1".into()));
        }
        if self.name_prefix.trim().is_empty() {
            return Err(PoolError::Config("name_prefix must not be empty".into()));
        }
        if let Some(size) = self.thread_stack_size {
            if size < MIN_THREAD_STACK_SIZE {
                return Err(PoolError::Config(format!(
                    "thread_stack_size {size} is below the minimum of {MIN_THREAD_STACK_SIZE} bytes"
                )));
            }
        }
        if let Some(init) = &self.init_task {
            if init.name.trim().is_empty() {
                return Err(PoolError::Config("init_task.name must not be empty".into()));
            }
        }
        Ok(())
    }
}
