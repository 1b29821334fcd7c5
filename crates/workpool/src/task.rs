//! Task values and their caller-side resolution.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::buffer::TransferBuffer;
use crate::error::TaskError;
use crate::message::TaskRequest;

/// A named unit of work with positional arguments and buffers to transfer.
///
/// Immutable once built. Cloning shares the transfer buffers, so buffers
/// moved by one dispatch read as empty in every clone.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    args: Vec<Value>,
    transfer: Vec<TransferBuffer>,
}

impl Task {
    pub fn new(name: impl Into<String>, args: Vec<Value>, transfer: Vec<TransferBuffer>) -> Self {
        Self {
            name: name.into(),
            args,
            transfer,
        }
    }

    /// A task with no arguments and nothing to transfer.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new(), Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn transfer(&self) -> &[TransferBuffer] {
        &self.transfer
    }

    pub(crate) fn request(&self) -> TaskRequest {
        TaskRequest {
            task: self.name.clone(),
            args: self.args.clone(),
        }
    }
}

/// Lets a task stand in for its name, e.g. in `cancel_pending`.
impl AsRef<str> for Task {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// Data a worker sent back for a completed task.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub data: Value,
    /// Buffers the worker moved back with its reply.
    pub transfer: Vec<TransferBuffer>,
}

impl TaskOutput {
    /// Deserialize the reply data into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// How a scheduled task settled, short of failing.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(TaskOutput),
    /// Cancelled while still queued; it never reached a worker.
    Cancelled,
}

impl TaskOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        match self {
            Self::Completed(out) => Some(out),
            Self::Cancelled => None,
        }
    }

    pub fn into_output(self) -> Option<TaskOutput> {
        match self {
            Self::Completed(out) => Some(out),
            Self::Cancelled => None,
        }
    }

    /// Reply data, or `None` when cancelled.
    pub fn data(&self) -> Option<&Value> {
        self.output().map(|out| &out.data)
    }
}

pub type TaskResolution = Result<TaskOutcome, TaskError>;

/// Future for a scheduled task's resolution.
///
/// Resolves exactly once. If the pool drops the task without resolving it
/// (its worker was killed), the handle yields [`TaskError::Abandoned`].
#[must_use = "a TaskHandle does nothing unless awaited"]
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskResolution>,
}

impl TaskHandle {
    pub(crate) fn ready(resolution: TaskResolution) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(resolution);
        Self { rx }
    }
}

impl Future for TaskHandle {
    type Output = TaskResolution;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(TaskError::Abandoned)))
    }
}

/// A task bound to the resolver of its caller's [`TaskHandle`].
///
/// Every resolving method consumes it, so it settles at most once.
#[derive(Debug)]
pub(crate) struct ScheduledTask {
    task: Task,
    resolver: oneshot::Sender<TaskResolution>,
}

impl ScheduledTask {
    pub(crate) fn new(task: Task) -> (Self, TaskHandle) {
        let (resolver, rx) = oneshot::channel();
        (Self { task, resolver }, TaskHandle { rx })
    }

    pub(crate) fn task(&self) -> &Task {
        &self.task
    }

    pub(crate) fn complete(self, output: TaskOutput) {
        self.settle(Ok(TaskOutcome::Completed(output)));
    }

    pub(crate) fn cancel(self) {
        self.settle(Ok(TaskOutcome::Cancelled));
    }

    pub(crate) fn fail(self, error: TaskError) {
        self.settle(Err(error));
    }

    fn settle(self, resolution: TaskResolution) {
        // The caller may have dropped its handle; nobody is left to tell.
        let _ = self.resolver.send(resolution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_is_pure_value() {
        let buf = TransferBuffer::new(vec![1, 2, 3]);
        let task = Task::new("addNumbers", vec![json!(9), json!(23)], vec![buf.clone()]);
        assert_eq!(task.name(), "addNumbers");
        assert_eq!(task.args(), &[json!(9), json!(23)]);
        assert_eq!(task.transfer().len(), 1);
        // building a task never moves its buffers
        assert_eq!(buf.len(), 3);
        let as_name: &str = task.as_ref();
        assert_eq!(as_name, "addNumbers");
    }

    #[tokio::test]
    async fn scheduled_task_resolves_handle() {
        let (scheduled, handle) = ScheduledTask::new(Task::named("simpleTask"));
        scheduled.complete(TaskOutput {
            data: json!(true),
            transfer: vec![],
        });
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.data(), Some(&json!(true)));
    }

    #[tokio::test]
    async fn cancel_is_distinct_from_success_and_failure() {
        let (scheduled, handle) = ScheduledTask::new(Task::named("waitAndPing"));
        scheduled.cancel();
        let outcome = handle.await.unwrap();
        assert!(outcome.is_cancelled());
        assert!(outcome.data().is_none());
    }

    #[tokio::test]
    async fn dropped_task_is_abandoned() {
        let (scheduled, handle) = ScheduledTask::new(Task::named("bounceNumber"));
        drop(scheduled);
        assert_eq!(handle.await.unwrap_err(), TaskError::Abandoned);
    }

    #[tokio::test]
    async fn failure_carries_error() {
        let (scheduled, handle) = ScheduledTask::new(Task::named("explode"));
        scheduled.fail(TaskError::Rejected("boom".into()));
        assert_eq!(handle.await.unwrap_err().reason(), Some("boom"));
    }

    #[test]
    fn output_decodes_into_types() {
        let out = TaskOutput {
            data: json!({"number": 4, "id": 1}),
            transfer: vec![],
        };
        #[derive(serde::Deserialize)]
        struct Bounce {
            number: u32,
            id: u32,
        }
        let b: Bounce = out.decode().unwrap();
        assert_eq!((b.number, b.id), (4, 1));
    }
}
