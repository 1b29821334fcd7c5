//! Pool configuration: TOML file, environment overrides, validation.

mod loading;
mod types;
mod validation;


pub use types::{InitTaskConfig, PoolConfig};
