//! The worker pool scheduler.
//!
//! [`WorkerPool`] tracks every worker it owns, keeps idle workers on a LIFO
//! stack and queues tasks FIFO while every worker is busy. Each worker has at
//! most one task in flight: a task is sent together with a one-shot reply
//! subscription, and when that reply lands the task is settled and the same
//! worker immediately pulls the next queued task (or goes back on the idle
//! stack).
//!
//! All pool state sits behind one mutex. It is only held for bookkeeping,
//! never while talking to a transport.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::buffer::TransferBuffer;
use crate::config::PoolConfig;
use crate::error::{PoolError, TaskError};
use crate::message::{Message, ReplyFrame, TaskReply};
use crate::task::{ScheduledTask, Task, TaskHandle, TaskOutcome, TaskOutput};
use crate::traits::{Event, EventKind, SubscriptionId, WorkerSpawner};
use crate::worker::{Worker, WorkerId};

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub pending: usize,
    /// Tasks sent to a worker, init tasks included.
    pub dispatched: u64,
    pub succeeded: u64,
    /// Tasks settled with an error reply, a dispatch failure or a protocol violation.
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<Arc<Worker>>,
    /// LIFO: the most recently freed worker is picked first.
    idle: Vec<Arc<Worker>>,
    /// FIFO by arrival.
    pending: VecDeque<ScheduledTask>,
    /// This pool's `Close` subscription on each tracked worker.
    close_watchers: HashMap<WorkerId, SubscriptionId>,
    dispatched: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
}

impl PoolState {
    fn is_tracked(&self, worker: &Arc<Worker>) -> bool {
        self.workers.iter().any(|w| Arc::ptr_eq(w, worker))
    }

    /// Forget a worker entirely. Returns it if it was tracked.
    fn untrack(&mut self, worker: &Arc<Worker>) -> Option<Arc<Worker>> {
        self.idle.retain(|w| !Arc::ptr_eq(w, worker));
        self.close_watchers.remove(&worker.id());
        let pos = self.workers.iter().position(|w| Arc::ptr_eq(w, worker))?;
        Some(self.workers.remove(pos))
    }
}

/// One-shot reply slot shared between a dispatch and its reply handler.
struct InFlight {
    task: Option<ScheduledTask>,
    subscription: Option<SubscriptionId>,
}

/// Distributes tasks across a mutable set of message-passing workers.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone, Default)]
pub struct WorkerPool {
    state: Arc<Mutex<PoolState>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool whose workers all start idle.
    pub fn with_workers(workers: impl IntoIterator<Item = Worker>) -> Self {
        let pool = Self::new();
        for worker in workers {
            let worker = Arc::new(worker);
            pool.track(&worker);
            pool.state.lock().idle.push(worker);
        }
        pool
    }

    /// Spawn `config.workers` workers and add them, running the configured
    /// init task on each.
    #[instrument(skip_all, fields(workers = config.workers, prefix = %config.name_prefix))]
    pub async fn spawn(config: &PoolConfig, spawner: &dyn WorkerSpawner) -> Result<Self, PoolError> {
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let name = format!("{}-{index}", config.name_prefix);
            workers.push(spawner.spawn(&name).await?);
        }

        let pool = Self::new();
        pool.add_workers(workers, config.init_task()).await?;
        info!(workers = pool.worker_count(), "pool ready");
        Ok(pool)
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn worker_count(&self) -> usize {
        self.state.lock().workers.len()
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether any task is queued or in flight.
    pub fn running(&self) -> bool {
        let state = self.state.lock();
        !state.pending.is_empty() || state.idle.len() < state.workers.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            workers: state.workers.len(),
            idle: state.idle.len(),
            pending: state.pending.len(),
            dispatched: state.dispatched,
            succeeded: state.succeeded,
            failed: state.failed,
            cancelled: state.cancelled,
        }
    }

    // ── Worker management ────────────────────────────────────────────

    /// Track a worker.
    ///
    /// With an init task, the task goes straight to this worker, ahead of
    /// anything queued, and the handle resolves with its result. Without one,
    /// the worker picks up queued work or goes idle, and the handle resolves
    /// at once with empty output.
    pub fn add_worker(&self, worker: Worker, init_task: Option<Task>) -> TaskHandle {
        let worker = Arc::new(worker);
        self.track(&worker);
        info!(worker = %worker.id(), name = %worker.name(), "worker added");

        match init_task {
            Some(task) => {
                let (scheduled, handle) = ScheduledTask::new(task);
                Self::execute_task(&self.state, worker, scheduled);
                handle
            }
            None => {
                Self::execute_from_queue(&self.state, worker);
                TaskHandle::ready(Ok(TaskOutcome::Completed(TaskOutput::default())))
            }
        }
    }

    /// Add several workers. Results come back in input order; the first
    /// failure fails the whole batch.
    pub fn add_workers(
        &self,
        workers: impl IntoIterator<Item = Worker>,
        init_task: Option<Task>,
    ) -> impl Future<Output = Result<Vec<TaskOutcome>, TaskError>> + Send + 'static {
        let handles: Vec<TaskHandle> = workers
            .into_iter()
            .map(|worker| self.add_worker(worker, init_task.clone()))
            .collect();
        try_join_all(handles)
    }

    /// Untrack one idle worker, if any. Busy workers are never removed.
    ///
    /// Which idle worker is returned is unspecified. The worker is not
    /// terminated; that is up to the caller. It comes back with no
    /// subscriptions from this pool, so it can be added to a pool again.
    pub fn remove_worker(&self) -> Option<Arc<Worker>> {
        let (worker, watcher) = {
            let mut state = self.state.lock();
            let worker = state.idle.pop()?;
            state.workers.retain(|w| !Arc::ptr_eq(w, &worker));
            let watcher = state.close_watchers.remove(&worker.id());
            (worker, watcher)
        };
        if let Some(id) = watcher {
            worker.transport().unsubscribe(EventKind::Close, id);
        }
        info!(worker = %worker.id(), "worker removed");
        Some(worker)
    }

    /// Terminate and untrack every worker.
    ///
    /// In-flight tasks are abandoned: their handles yield
    /// [`TaskError::Abandoned`]. Queued tasks stay queued and run if workers
    /// are added later. Do not schedule against a pool that is about to be killed.
    pub fn kill_workers(&self) {
        let workers = {
            let mut state = self.state.lock();
            state.idle.clear();
            state.close_watchers.clear();
            std::mem::take(&mut state.workers)
        };
        for worker in &workers {
            worker.terminate();
        }
        info!(killed = workers.len(), "workers killed");
    }

    // ── Tasks ────────────────────────────────────────────────────────

    /// Build a task. Pure; nothing is sent.
    pub fn make_task(
        &self,
        name: impl Into<String>,
        args: Vec<serde_json::Value>,
        transfer: Vec<TransferBuffer>,
    ) -> Task {
        Task::new(name, args, transfer)
    }

    /// Run a task on the most recently freed idle worker, or queue it.
    ///
    /// Dispatch happens before this returns, so transfer buffers of a task
    /// sent right away already read as empty.
    pub fn schedule_task(&self, task: Task) -> TaskHandle {
        let (scheduled, handle) = ScheduledTask::new(task);
        let dispatch = {
            let mut state = self.state.lock();
            match state.idle.pop() {
                Some(worker) => Some((worker, scheduled)),
                None => {
                    debug!(
                        task = %scheduled.task().name(),
                        queued = state.pending.len() + 1,
                        "no idle worker, task queued"
                    );
                    state.pending.push_back(scheduled);
                    None
                }
            }
        };
        if let Some((worker, scheduled)) = dispatch {
            Self::execute_task(&self.state, worker, scheduled);
        }
        handle
    }

    /// Schedule several tasks. Results come back in input order; the first
    /// failure fails the whole batch.
    pub fn schedule_tasks(
        &self,
        tasks: impl IntoIterator<Item = Task>,
    ) -> impl Future<Output = Result<Vec<TaskOutcome>, TaskError>> + Send + 'static {
        let handles: Vec<TaskHandle> = tasks
            .into_iter()
            .map(|task| self.schedule_task(task))
            .collect();
        try_join_all(handles)
    }

    /// Cancel every queued task. In-flight tasks are untouched.
    pub fn cancel_all_pending(&self) -> usize {
        let cancelled: Vec<ScheduledTask> = {
            let mut state = self.state.lock();
            let drained: Vec<ScheduledTask> = state.pending.drain(..).collect();
            state.cancelled += drained.len() as u64;
            drained
        };
        let count = cancelled.len();
        for task in cancelled {
            task.cancel();
        }
        debug!(count, "cancelled all pending tasks");
        count
    }

    /// Cancel queued tasks with the given name (a `&str`, `String` or a
    /// [`Task`]). Other queued tasks keep their order.
    pub fn cancel_pending(&self, name: impl AsRef<str>) -> usize {
        let name = name.as_ref();
        let cancelled: VecDeque<ScheduledTask> = {
            let mut state = self.state.lock();
            let (cancelled, kept): (VecDeque<_>, VecDeque<_>) = state
                .pending
                .drain(..)
                .partition(|t| t.task().name() == name);
            state.pending = kept;
            state.cancelled += cancelled.len() as u64;
            cancelled
        };
        let count = cancelled.len();
        for task in cancelled {
            task.cancel();
        }
        debug!(task = %name, count, "cancelled pending tasks");
        count
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Send a task to a worker that is already marked busy and arm a
    /// one-shot reply handler for it.
    fn execute_task(state: &Arc<Mutex<PoolState>>, worker: Arc<Worker>, scheduled: ScheduledTask) {
        let message = match Message::new(&scheduled.task().request()) {
            Ok(message) => message,
            Err(e) => {
                warn!(task = %scheduled.task().name(), error = %e, "failed to encode task");
                state.lock().failed += 1;
                scheduled.fail(TaskError::Dispatch(e.to_string()));
                Self::execute_from_queue(state, worker);
                return;
            }
        };

        let name = scheduled.task().name().to_string();
        let transfer = scheduled.task().transfer().to_vec();
        let in_flight = Arc::new(Mutex::new(InFlight {
            task: Some(scheduled),
            subscription: None,
        }));

        let handler = {
            let state = Arc::downgrade(state);
            let worker = Arc::downgrade(&worker);
            let in_flight = Arc::clone(&in_flight);
            Arc::new(move |event: Event| {
                let Event::Message(reply) = event else {
                    return;
                };
                Self::on_reply(&state, &worker, &in_flight, reply);
            })
        };

        let transport = worker.transport();
        let sent = transport
            .subscribe(EventKind::Message, handler)
            .and_then(|id| {
                in_flight.lock().subscription = Some(id);
                transport.send(message, &transfer)
            });

        match sent {
            Ok(()) => {
                state.lock().dispatched += 1;
                debug!(worker = %worker.id(), task = %name, "task dispatched");
            }
            Err(e) => {
                let (task, subscription) = {
                    let mut slot = in_flight.lock();
                    (slot.task.take(), slot.subscription.take())
                };
                if let Some(id) = subscription {
                    transport.unsubscribe(EventKind::Message, id);
                }
                warn!(worker = %worker.id(), task = %name, error = %e, "dispatch failed, dropping worker");
                {
                    let mut state = state.lock();
                    state.failed += 1;
                    state.untrack(&worker);
                }
                if let Some(task) = task {
                    task.fail(TaskError::Dispatch(e.to_string()));
                }
            }
        }
    }

    /// Handle the single reply to a dispatched task.
    fn on_reply(
        state: &Weak<Mutex<PoolState>>,
        worker: &Weak<Worker>,
        in_flight: &Mutex<InFlight>,
        reply: Message,
    ) {
        let (task, subscription) = {
            let mut slot = in_flight.lock();
            match slot.task.take() {
                Some(task) => (task, slot.subscription.take()),
                None => {
                    debug!("reply for a task that is no longer tracked, dropped");
                    return;
                }
            }
        };

        // The worker handle may already be gone (killed while the reply was
        // in transit); the task still resolves, the worker is just not reused.
        let worker = worker.upgrade();
        if let (Some(worker), Some(id)) = (&worker, subscription) {
            worker.transport().unsubscribe(EventKind::Message, id);
        }
        let state = state.upgrade();

        let decoded = reply
            .decode::<ReplyFrame>()
            .map_err(|e| format!("undecodable reply: {e}"))
            .and_then(|frame| {
                TaskReply::try_from(frame).map_err(|s| format!("unrecognized reply state `{s}`"))
            });

        let answer = match decoded {
            Ok(answer) => answer,
            Err(violation) => {
                error!(
                    worker = ?worker.as_ref().map(|w| w.id()),
                    task = %task.task().name(),
                    violation = %violation,
                    "protocol violation, terminating worker"
                );
                if let Some(worker) = worker {
                    if let Some(state) = &state {
                        let mut state = state.lock();
                        state.failed += 1;
                        state.untrack(&worker);
                    }
                    worker.terminate();
                }
                task.fail(TaskError::ProtocolViolation(violation));
                return;
            }
        };

        // The worker is freed before the caller hears back, so a caller
        // resuming on the result already sees it idle or busy again.
        if let Some(state) = &state {
            {
                let mut state = state.lock();
                match answer {
                    TaskReply::Success(_) => state.succeeded += 1,
                    TaskReply::Error(_) => state.failed += 1,
                }
            }
            if let Some(worker) = worker {
                Self::execute_from_queue(state, worker);
            }
        }

        match answer {
            TaskReply::Success(data) => {
                debug!(task = %task.task().name(), "task succeeded");
                task.complete(TaskOutput {
                    data,
                    transfer: reply.transfer,
                });
            }
            TaskReply::Error(reason) => {
                debug!(task = %task.task().name(), reason = %reason, "task failed");
                task.fail(TaskError::Rejected(reason));
            }
        }
    }

    /// Give a free worker the oldest queued task, or put it on the idle stack.
    fn execute_from_queue(state: &Arc<Mutex<PoolState>>, worker: Arc<Worker>) {
        let next = {
            let mut state = state.lock();
            if !state.is_tracked(&worker) {
                debug!(worker = %worker.id(), "worker no longer tracked, not reused");
                return;
            }
            match state.pending.pop_front() {
                Some(task) => Some(task),
                None => {
                    state.idle.push(Arc::clone(&worker));
                    None
                }
            }
        };
        if let Some(task) = next {
            Self::execute_task(state, worker, task);
        }
    }

    /// Start tracking a worker (busy until it is idled or given a task).
    fn track(&self, worker: &Arc<Worker>) {
        let watcher = self.watch_close(worker);
        let mut state = self.state.lock();
        state.workers.push(Arc::clone(worker));
        if let Some(id) = watcher {
            state.close_watchers.insert(worker.id(), id);
        }
    }

    /// Drop a worker from the pool once its endpoint reports it has gone away.
    fn watch_close(&self, worker: &Arc<Worker>) -> Option<SubscriptionId> {
        let state = Arc::downgrade(&self.state);
        let watched = Arc::downgrade(worker);
        let on_close = Arc::new(move |_event: Event| {
            let (Some(state), Some(worker)) = (state.upgrade(), watched.upgrade()) else {
                return;
            };
            let removed = state.lock().untrack(&worker);
            if removed.is_some() {
                warn!(worker = %worker.id(), name = %worker.name(), "worker endpoint closed, untracked");
            }
        });
        match worker.transport().subscribe(EventKind::Close, on_close) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(worker = %worker.id(), error = %e, "could not watch worker for close");
                None
            }
        }
    }
}
