use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::traits::Transport;

/// Unique identity of a worker handle, used in logs and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(Uuid);

impl WorkerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an isolated execution unit, reachable only through its transport.
///
/// Once added to a [`WorkerPool`](crate::pool::WorkerPool) the pool owns the
/// handle's busy/idle state.
pub struct Worker {
    id: WorkerId,
    name: String,
    transport: Arc<dyn Transport>,
}

impl Worker {
    pub fn new(name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self::from_arc(name, Arc::new(transport))
    }

    pub fn from_arc(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: WorkerId::new(),
            name: name.into(),
            transport,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Terminate the underlying execution unit. The handle is dead afterwards.
    pub fn terminate(&self) {
        self.transport.terminate();
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
