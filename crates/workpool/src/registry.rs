//! Worker-side task execution.
//!
//! A [`TaskExecutor`] maps task names to async handlers. A
//! [`TaskExecutorRegistry`] stacks executors on top of a worker's transport:
//! each inbound request goes to the first executor, in registration order,
//! that knows the task name. The reply is always a success or error message;
//! a failing or panicking handler never takes the worker down.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::buffer::TransferBuffer;
use crate::error::PoolError;
use crate::message::{Message, ReplyFrame, TaskRequest};
use crate::traits::{Event, EventHandler, EventKind, SubscriptionId, Transport};

// ── Handler types ────────────────────────────────────────────────────

/// Boxed future returned by a task handler.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<TaskResult>> + Send>>;

/// Boxed async function that runs one task.
pub type TaskFn = Box<dyn Fn(TaskCall) -> TaskFuture + Send + Sync>;

/// Arguments a handler is invoked with.
#[derive(Debug, Clone, Default)]
pub struct TaskCall {
    pub args: Vec<Value>,
    /// Buffers moved to this worker with the request.
    pub transfer: Vec<TransferBuffer>,
}

impl TaskCall {
    /// Deserialize positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .with_context(|| format!("missing argument {index}"))?;
        T::deserialize(value).with_context(|| format!("argument {index} has an unexpected type"))
    }

    pub fn buffer(&self, index: usize) -> anyhow::Result<&TransferBuffer> {
        self.transfer
            .get(index)
            .with_context(|| format!("missing transfer buffer {index}"))
    }
}

/// What a handler hands back: reply data plus buffers to move back.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub result: Value,
    pub transfer: Vec<TransferBuffer>,
}

impl TaskResult {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            transfer: Vec::new(),
        }
    }

    pub fn with_transfer(mut self, transfer: Vec<TransferBuffer>) -> Self {
        self.transfer = transfer;
        self
    }
}

impl From<Value> for TaskResult {
    fn from(result: Value) -> Self {
        Self::new(result)
    }
}

// ── TaskExecutor ─────────────────────────────────────────────────────

/// A named set of task handlers.
///
/// # Example
/// ```ignore
/// let math = TaskExecutor::new("math")
///     .sync_task("addNumbers", |call| {
///         let (a, b): (i64, i64) = (call.arg(0)?, call.arg(1)?);
///         Ok(json!(a + b).into())
///     })
///     .task("waitAndPing", |call| async move {
///         tokio::time::sleep(Duration::from_millis(call.arg(0)?)).await;
///         Ok(json!("pong").into())
///     });
/// ```
pub struct TaskExecutor {
    name: String,
    tasks: HashMap<String, TaskFn>,
}

impl TaskExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: HashMap::new(),
        }
    }

    /// Register an async handler. A later registration under the same name replaces it.
    pub fn task<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TaskResult>> + Send + 'static,
    {
        self.tasks
            .insert(name.into(), Box::new(move |call| Box::pin(handler(call))));
        self
    }

    /// Register a handler that completes without awaiting anything.
    pub fn sync_task<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskCall) -> anyhow::Result<TaskResult> + Send + Sync + 'static,
    {
        self.task(name, move |call| std::future::ready(handler(call)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handles(&self, task: &str) -> bool {
        self.tasks.contains_key(task)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    fn invoke(&self, task: &str, call: TaskCall) -> Option<TaskFuture> {
        self.tasks.get(task).map(|handler| handler(call))
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.task_names().collect();
        names.sort_unstable();
        f.debug_struct("TaskExecutor")
            .field("name", &self.name)
            .field("tasks", &names)
            .finish()
    }
}

// ── TaskExecutorRegistry ─────────────────────────────────────────────

/// Dormant until the first executor is added; only then is a message
/// handler installed on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryState {
    Dormant,
    Active(SubscriptionId),
}

struct Inner {
    executors: Vec<Arc<TaskExecutor>>,
    state: RegistryState,
}

/// Serves task requests arriving on a worker's transport.
///
/// Handlers run on the runtime the registry was created on, whichever thread
/// the transport delivers requests from.
pub struct TaskExecutorRegistry {
    transport: Arc<dyn Transport>,
    runtime: Handle,
    inner: Arc<Mutex<Inner>>,
}

impl TaskExecutorRegistry {
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            runtime: Handle::current(),
            inner: Arc::new(Mutex::new(Inner {
                executors: Vec::new(),
                state: RegistryState::Dormant,
            })),
        }
    }

    /// Add an executor behind the ones already registered.
    ///
    /// The first executor activates the registry. Returns `false` if this
    /// exact executor is already registered.
    pub fn add_executor(&self, executor: Arc<TaskExecutor>) -> Result<bool, PoolError> {
        let mut inner = self.inner.lock();
        if inner.executors.iter().any(|e| Arc::ptr_eq(e, &executor)) {
            return Ok(false);
        }
        if inner.state == RegistryState::Dormant {
            let id = self
                .transport
                .subscribe(EventKind::Message, self.message_handler())?;
            inner.state = RegistryState::Active(id);
            debug!(executor = %executor.name(), "registry active");
        }
        inner.executors.push(executor);
        Ok(true)
    }

    /// Remove an executor. Removing the last one puts the registry back to sleep.
    pub fn remove_executor(&self, executor: &Arc<TaskExecutor>) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.executors.iter().position(|e| Arc::ptr_eq(e, executor)) else {
            return false;
        };
        inner.executors.remove(pos);
        if inner.executors.is_empty() {
            if let RegistryState::Active(id) =
                std::mem::replace(&mut inner.state, RegistryState::Dormant)
            {
                self.transport.unsubscribe(EventKind::Message, id);
                debug!("registry dormant");
            }
        }
        true
    }

    pub fn is_active(&self) -> bool {
        matches!(self.inner.lock().state, RegistryState::Active(_))
    }

    pub fn executor_count(&self) -> usize {
        self.inner.lock().executors.len()
    }

    fn message_handler(&self) -> EventHandler {
        let inner = Arc::downgrade(&self.inner);
        let transport = Arc::downgrade(&self.transport);
        let runtime = self.runtime.clone();
        Arc::new(move |event| {
            let Event::Message(message) = event else {
                return;
            };
            if let (Some(inner), Some(transport)) = (inner.upgrade(), transport.upgrade()) {
                Self::handle_request(&runtime, &inner, transport, message);
            }
        })
    }

    /// Look up the first executor for the requested task and run it on the
    /// registry's runtime; the reply is sent when it settles.
    fn handle_request(
        runtime: &Handle,
        inner: &Mutex<Inner>,
        transport: Arc<dyn Transport>,
        message: Message,
    ) {
        let request: TaskRequest = match message.decode() {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed task request");
                Self::reply(&*transport, ReplyFrame::error(format!("malformed task request: {e}")), &[]);
                return;
            }
        };

        let executor = inner
            .lock()
            .executors
            .iter()
            .find(|e| e.handles(&request.task))
            .cloned();
        let Some(executor) = executor else {
            debug!(task = %request.task, "no executor for task");
            Self::reply(
                &*transport,
                ReplyFrame::error(format!("unrecognized task: `{}`", request.task)),
                &[],
            );
            return;
        };

        let task = request.task;
        let call = TaskCall {
            args: request.args,
            transfer: message.transfer,
        };
        debug!(task = %task, executor = %executor.name(), "running task");

        runtime.spawn(async move {
            let run = AssertUnwindSafe(async {
                match executor.invoke(&task, call) {
                    Some(fut) => fut.await,
                    None => Err(anyhow::anyhow!("unrecognized task: `{task}`")),
                }
            })
            .catch_unwind()
            .await;

            let (frame, transfer) = match run {
                Ok(Ok(result)) => (ReplyFrame::success(result.result), result.transfer),
                Ok(Err(err)) => {
                    let reason = format!("{err:#}");
                    debug!(task = %task, reason = %reason, "task failed");
                    (ReplyFrame::error(reason), Vec::new())
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    warn!(task = %task, reason = %reason, "task handler panicked");
                    (ReplyFrame::error(format!("task panicked: {reason}")), Vec::new())
                }
            };
            Self::reply(&*transport, frame, &transfer);
        });
    }

    fn reply(transport: &dyn Transport, frame: ReplyFrame, transfer: &[TransferBuffer]) {
        let message = match Message::new(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = transport.send(message, transfer) {
            warn!(error = %e, "failed to send reply");
        }
    }
}

impl Drop for TaskExecutorRegistry {
    fn drop(&mut self) {
        if let RegistryState::Active(id) = self.inner.lock().state {
            self.transport.unsubscribe(EventKind::Message, id);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::transport::ChannelTransport;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(100);

    struct Harness {
        pool_side: ChannelTransport,
        replies: mpsc::UnboundedReceiver<Message>,
        registry: TaskExecutorRegistry,
    }

    impl Harness {
        fn new() -> Self {
            let (pool_side, worker_side) = ChannelTransport::pair();
            let (tx, replies) = mpsc::unbounded_channel();
            pool_side
                .subscribe(
                    EventKind::Message,
                    Arc::new(move |event| {
                        if let Event::Message(msg) = event {
                            let _ = tx.send(msg);
                        }
                    }),
                )
                .unwrap();
            let registry = TaskExecutorRegistry::new(Arc::new(worker_side));
            Self {
                pool_side,
                replies,
                registry,
            }
        }

        fn request(&self, task: &str, args: Vec<Value>, transfer: &[TransferBuffer]) {
            let msg = Message::new(&TaskRequest {
                task: task.into(),
                args,
            })
            .unwrap();
            self.pool_side.send(msg, transfer).unwrap();
        }

        async fn reply(&mut self) -> (ReplyFrame, Message) {
            let msg = tokio::time::timeout(TIMEOUT, self.replies.recv())
                .await
                .expect("reply within timeout")
                .expect("reply channel open");
            (msg.decode().unwrap(), msg)
        }

        async fn assert_silent(&mut self) {
            assert!(tokio::time::timeout(QUIET, self.replies.recv()).await.is_err());
        }
    }

    fn pinger() -> Arc<TaskExecutor> {
        Arc::new(
            TaskExecutor::new("pinger")
                .sync_task("ping", |_| Ok(json!({"result": "pong"}).into()))
                .sync_task("whoami", |_| Ok(json!("pinger").into())),
        )
    }

    #[tokio::test]
    async fn dormant_registry_ignores_requests() {
        let mut h = Harness::new();
        assert!(!h.registry.is_active());
        h.request("ping", vec![], &[]);
        h.assert_silent().await;
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        let mut h = Harness::new();
        assert!(h.registry.add_executor(pinger()).unwrap());
        assert!(h.registry.is_active());

        h.request("ping", vec![], &[]);
        let (frame, _) = h.reply().await;
        assert_eq!(frame, ReplyFrame::success(json!({"result": "pong"})));
    }

    #[tokio::test]
    async fn unknown_task_is_rejected() {
        let mut h = Harness::new();
        h.registry.add_executor(pinger()).unwrap();

        h.request("unknownTask", vec![], &[]);
        let (frame, _) = h.reply().await;
        assert_eq!(frame.state, "error");
        assert_eq!(frame.reason.as_deref(), Some("unrecognized task: `unknownTask`"));
    }

    #[tokio::test]
    async fn first_registered_executor_wins() {
        let mut h = Harness::new();
        let shadow = Arc::new(
            TaskExecutor::new("shadow").sync_task("whoami", |_| Ok(json!("shadow").into())),
        );
        h.registry.add_executor(pinger()).unwrap();
        h.registry.add_executor(shadow.clone()).unwrap();

        h.request("whoami", vec![], &[]);
        assert_eq!(h.reply().await.0.data, Some(json!("pinger")));

        // Tasks only the later executor knows still reach it.
        let extra = Arc::new(
            TaskExecutor::new("extra").sync_task("onlyHere", |_| Ok(json!(1).into())),
        );
        h.registry.add_executor(extra).unwrap();
        h.request("onlyHere", vec![], &[]);
        assert_eq!(h.reply().await.0.data, Some(json!(1)));
    }

    #[tokio::test]
    async fn handler_error_becomes_error_reply() {
        let mut h = Harness::new();
        let failing = Arc::new(TaskExecutor::new("failing").sync_task("setID", |call| {
            let id: u32 = call.arg(0)?;
            anyhow::bail!("this worker already has an ID: {id}")
        }));
        h.registry.add_executor(failing).unwrap();

        h.request("setID", vec![json!(3)], &[]);
        let (frame, _) = h.reply().await;
        assert_eq!(frame.reason.as_deref(), Some("this worker already has an ID: 3"));

        h.request("setID", vec![], &[]);
        let (frame, _) = h.reply().await;
        assert!(frame.reason.unwrap().contains("missing argument 0"));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_worker() {
        let mut h = Harness::new();
        let fragile = Arc::new(
            TaskExecutor::new("fragile")
                .sync_task("explode", |_| panic!("kaboom"))
                .sync_task("ping", |_| Ok(json!("pong").into())),
        );
        h.registry.add_executor(fragile).unwrap();

        h.request("explode", vec![], &[]);
        let (frame, _) = h.reply().await;
        assert_eq!(frame.reason.as_deref(), Some("task panicked: kaboom"));

        h.request("ping", vec![], &[]);
        assert_eq!(h.reply().await.0.data, Some(json!("pong")));
    }

    #[tokio::test]
    async fn removing_last_executor_goes_dormant() {
        let mut h = Harness::new();
        let exec = pinger();
        h.registry.add_executor(exec.clone()).unwrap();
        assert!(!h.registry.add_executor(exec.clone()).unwrap());
        assert_eq!(h.registry.executor_count(), 1);

        assert!(h.registry.remove_executor(&exec));
        assert!(!h.registry.remove_executor(&exec));
        assert!(!h.registry.is_active());

        h.request("ping", vec![], &[]);
        h.assert_silent().await;
    }

    #[tokio::test]
    async fn buffers_move_both_ways() {
        let mut h = Harness::new();
        let bouncer = Arc::new(TaskExecutor::new("bouncer").sync_task(
            "bounceTransfer",
            |call| {
                let buf = call.buffer(0)?.clone();
                let reference: Vec<u32> = call.arg(0)?;
                anyhow::ensure!(buf.to_u32s() == reference, "transferred data differs");
                Ok(TaskResult::new(json!(buf.len())).with_transfer(vec![buf]))
            },
        ));
        h.registry.add_executor(bouncer).unwrap();

        let reference = [1u32, 2, 3, 5, 7, 11, 13];
        let sent = TransferBuffer::from_u32s(&reference);
        h.request("bounceTransfer", vec![json!(reference)], &[sent.clone()]);
        assert!(sent.is_empty());

        let (frame, msg) = h.reply().await;
        assert_eq!(frame.data, Some(json!(28)));
        assert_eq!(msg.transfer.len(), 1);
        assert_eq!(msg.transfer[0].to_u32s(), reference);
    }

    #[tokio::test]
    async fn async_handlers_are_awaited() {
        let mut h = Harness::new();
        let waiter = Arc::new(TaskExecutor::new("waiter").task("waitAndPing", |call| async move {
            let ms: u64 = call.arg(0)?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!("pong").into())
        }));
        h.registry.add_executor(waiter).unwrap();

        h.request("waitAndPing", vec![json!(10)], &[]);
        assert_eq!(h.reply().await.0.data, Some(json!("pong")));
    }

    /// Hands the registry's handler to the test so it can be called from any thread.
    struct Captured {
        handler: Mutex<Option<EventHandler>>,
        replies: mpsc::UnboundedSender<Message>,
    }

    impl Transport for Captured {
        fn send(&self, message: Message, _transfer: &[TransferBuffer]) -> Result<(), PoolError> {
            self.replies
                .send(message)
                .map_err(|_| PoolError::Transport("test receiver dropped".into()))
        }

        fn subscribe(
            &self,
            _kind: EventKind,
            handler: EventHandler,
        ) -> Result<SubscriptionId, PoolError> {
            *self.handler.lock() = Some(handler);
            Ok(SubscriptionId(1))
        }

        fn unsubscribe(&self, _kind: EventKind, _id: SubscriptionId) -> bool {
            self.handler.lock().take().is_some()
        }

        fn terminate(&self) {}
    }

    #[tokio::test]
    async fn serves_requests_delivered_off_runtime() {
        let (tx, mut replies) = mpsc::unbounded_channel();
        let transport = Arc::new(Captured {
            handler: Mutex::new(None),
            replies: tx,
        });
        let registry = TaskExecutorRegistry::new(transport.clone());
        registry.add_executor(pinger()).unwrap();
        let handler = transport.handler.lock().clone().expect("registry subscribed");

        let request = Message::new(&TaskRequest {
            task: "ping".into(),
            args: vec![],
        })
        .unwrap();
        std::thread::spawn(move || handler(Event::Message(request)))
            .join()
            .expect("delivery thread does not panic");

        let reply = tokio::time::timeout(TIMEOUT, replies.recv()).await.unwrap().unwrap();
        let frame: ReplyFrame = reply.decode().unwrap();
        assert_eq!(frame, ReplyFrame::success(json!({"result": "pong"})));
    }
}
