pub mod buffer;
pub mod config;
pub mod error;
pub mod message;
pub mod pool;
pub mod registry;
pub mod spawn;
pub mod task;
pub mod traits;
pub mod transport;
pub mod worker;

pub use buffer::TransferBuffer;
pub use config::{InitTaskConfig, PoolConfig};
pub use error::{PoolError, TaskError};
pub use message::{Message, ReplyFrame, TaskReply, TaskRequest};
pub use pool::{PoolStats, WorkerPool};
pub use registry::{TaskCall, TaskExecutor, TaskExecutorRegistry, TaskResult};
pub use spawn::{ExecutorFactory, ThreadSpawner};
pub use task::{Task, TaskHandle, TaskOutcome, TaskOutput, TaskResolution};
pub use traits::{Event, EventHandler, EventKind, SubscriptionId, Transport, WorkerSpawner};
pub use transport::{ChannelEnd, ChannelTransport};
pub use worker::{Worker, WorkerId};
