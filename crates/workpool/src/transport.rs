//! In-process [`Transport`] built on tokio channels.
//!
//! Each [`ChannelTransport`] owns the sending half towards its peer and a
//! background receive loop that fans inbound messages out to subscribers.
//! The two ends of a channel can live on different runtimes: the pool side
//! on the caller's runtime, the worker side on the worker thread's own.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::buffer::TransferBuffer;
use crate::error::PoolError;
use crate::message::Message;
use crate::traits::{Event, EventHandler, EventKind, SubscriptionId, Transport};

/// One unconnected end of a channel pair. See [`ChannelTransport::channel`].
pub struct ChannelEnd {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Transport endpoint over an unbounded tokio mpsc channel pair.
pub struct ChannelTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    listeners: Arc<Mutex<Listeners>>,
    closed: Arc<watch::Sender<bool>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelTransport {
    /// Create two crossed channel ends, not yet connected.
    pub fn channel() -> (ChannelEnd, ChannelEnd) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            ChannelEnd { tx: a_tx, rx: a_rx },
            ChannelEnd { tx: b_tx, rx: b_rx },
        )
    }

    /// Connect one end, spawning its receive loop on the current tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime.
    pub fn connect(end: ChannelEnd) -> Self {
        let listeners = Arc::new(Mutex::new(Listeners::default()));
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let pump = tokio::spawn(Self::event_loop(
            end.rx,
            Arc::clone(&listeners),
            Arc::clone(&closed),
        ));

        Self {
            outbound: Mutex::new(Some(end.tx)),
            listeners,
            closed,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Create and connect both ends on the current runtime.
    pub fn pair() -> (Self, Self) {
        let (a, b) = Self::channel();
        (Self::connect(a), Self::connect(b))
    }

    /// Resolves once this endpoint is terminated or its peer hangs up.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receive loop: runs until the peer drops its sending half.
    async fn event_loop(
        mut inbound: mpsc::UnboundedReceiver<Message>,
        listeners: Arc<Mutex<Listeners>>,
        closed: Arc<watch::Sender<bool>>,
    ) {
        while let Some(message) = inbound.recv().await {
            Self::dispatch(&listeners, Event::Message(message));
        }
        debug!("peer endpoint hung up");
        Self::dispatch(&listeners, Event::Close);
        closed.send_replace(true);
    }

    /// Deliver an event to a snapshot of the current subscribers.
    ///
    /// Handlers run without the listener lock held, so they may subscribe
    /// or unsubscribe (themselves included).
    fn dispatch(listeners: &Mutex<Listeners>, event: Event) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = listeners
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        if handlers.is_empty() {
            trace!(?kind, "no subscriber, event dropped");
            return;
        }
        for handler in handlers {
            handler(event.clone());
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, mut message: Message, transfer: &[TransferBuffer]) -> Result<(), PoolError> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(PoolError::Terminated)?;
        message
            .transfer
            .extend(transfer.iter().map(TransferBuffer::transfer));
        tx.send(message)
            .map_err(|_| PoolError::Transport("peer endpoint is gone".into()))
    }

    fn subscribe(
        &self,
        kind: EventKind,
        handler: EventHandler,
    ) -> Result<SubscriptionId, PoolError> {
        if self.outbound.lock().is_none() {
            return Err(PoolError::Terminated);
        }
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = SubscriptionId(listeners.next_id);
        listeners.subscribers.push(Subscriber { id, kind, handler });
        Ok(id)
    }

    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let removed = {
            let mut listeners = self.listeners.lock();
            listeners
                .subscribers
                .iter()
                .position(|s| s.id == id && s.kind == kind)
                .map(|pos| listeners.subscribers.remove(pos))
        };
        removed.is_some()
    }

    fn terminate(&self) {
        if self.outbound.lock().take().is_none() {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let dropped = std::mem::take(&mut self.listeners.lock().subscribers);
        self.closed.send_replace(true);
        debug!(subscribers = dropped.len(), "transport terminated");
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}
