use thiserror::Error;

/// Errors raised by the pool's own machinery: transports, spawning, config.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport terminated")]
    Terminated,

    #[error("worker spawn failed: {0}")]
    Spawn(String),

    #[error("init task failed: {0}")]
    InitTask(#[from] TaskError),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

/// Failure outcome of a scheduled task, as seen by the caller.
///
/// Cancellation is not an error; it resolves as [`TaskOutcome::Cancelled`].
///
/// [`TaskOutcome::Cancelled`]: crate::task::TaskOutcome::Cancelled
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The worker answered with an error reply: unknown task name or a failing handler.
    #[error("task rejected: {0}")]
    Rejected(String),

    /// The worker answered with something that is neither a success nor an error reply.
    /// Points at a transport or framing bug; the offending worker is dropped from the pool.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The request never reached the worker.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// The pool let go of the task without resolving it (its worker was killed).
    #[error("task abandoned before a reply arrived")]
    Abandoned,
}

impl TaskError {
    /// The reason carried by a worker's error reply, if this is one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Whether this error signals a broken worker rather than a failed task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }
}
