use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::buffer::TransferBuffer;
use crate::error::PoolError;
use crate::message::Message;
use crate::worker::Worker;

/// Kinds of events a [`Transport`] delivers to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An inbound message from the peer endpoint.
    Message,
    /// The peer endpoint hung up. Delivered at most once.
    Close,
}

/// An event delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    Message(Message),
    Close,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::Close => EventKind::Close,
        }
    }
}

/// Callback invoked for every event of the kind it was subscribed to.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Handle returned by [`Transport::subscribe`], used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Message-passing capability over one isolated execution unit.
///
/// Implementations must deliver each sent message at most once and in order.
/// The scheduler and the executor registry depend on this trait only, never
/// on a concrete transport.
pub trait Transport: Send + Sync {
    /// Send a message. Every buffer in `transfer` is moved to the receiver and
    /// reads as zero-length on this side once `send` returns.
    fn send(&self, message: Message, transfer: &[TransferBuffer]) -> Result<(), PoolError>;

    /// Register a handler for events of `kind`.
    fn subscribe(&self, kind: EventKind, handler: EventHandler)
        -> Result<SubscriptionId, PoolError>;

    /// Remove a handler. Returns `false` if `id` was not subscribed to `kind`.
    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool;

    /// Shut the endpoint down. The transport is unusable afterwards.
    fn terminate(&self);
}

/// Blanket implementation so `Arc<dyn Transport>` can be used directly.
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, message: Message, transfer: &[TransferBuffer]) -> Result<(), PoolError> {
        (**self).send(message, transfer)
    }

    fn subscribe(
        &self,
        kind: EventKind,
        handler: EventHandler,
    ) -> Result<SubscriptionId, PoolError> {
        (**self).subscribe(kind, handler)
    }

    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        (**self).unsubscribe(kind, id)
    }

    fn terminate(&self) {
        (**self).terminate()
    }
}

/// Creates workers that are connected and ready to accept tasks.
///
/// Whatever bootstraps the execution unit must have an active executor
/// registry on the far side before `spawn` returns.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, name: &str) -> Result<Worker, PoolError>;
}
