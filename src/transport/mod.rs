//! Realtime event channel: fire events with an acknowledgment, and listen for
//! server-initiated pushes.

pub mod frame;
pub mod memory;
pub mod socket;

use crate::error::TransportError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tracing::{info, trace};

pub use memory::MemoryTransport;
pub use socket::SocketTransport;

pub trait Transport: Send + Sync {
    /// Sends `event` and returns a handle that resolves with the peer's
    /// acknowledgment. Never blocks.
    fn emit(&self, event: &str, payload: Value) -> Ack;

    /// Registers a handler for pushes named `event`.
    fn on(&self, event: &str) -> Listener;

    /// Removes a handler registered with [`Transport::on`]. Unknown ids are
    /// ignored.
    fn off(&self, event: &str, id: ListenerId);
}

/// Pending acknowledgment of one emitted event.
pub struct Ack {
    rx: oneshot::Receiver<Result<Value, TransportError>>,
}

impl Ack {
    pub(crate) fn channel() -> (oneshot::Sender<Result<Value, TransportError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// An acknowledgment that is already settled.
    pub fn ready(result: Result<Value, TransportError>) -> Self {
        let (tx, ack) = Self::channel();
        let _ = tx.send(result);
        ack
    }

    /// Resolves once the peer answers. A dropped responder (the connection went
    /// away) reads as [`TransportError::Disconnected`].
    pub async fn wait(self) -> Result<Value, TransportError> {
        self.rx.await.unwrap_or(Err(TransportError::Disconnected))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receiving end of a push subscription.
pub struct Listener {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Next push payload, or `None` once the handler was removed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Handler table shared by the transport implementations.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(ListenerId, mpsc::UnboundedSender<Value>)>>>,
}

impl Listeners {
    pub(crate) fn add(&self, event: &str) -> Listener {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .entry(event.to_string())
            .or_default()
            .push((id, tx));
        trace!(event, ?id, "listener bound");
        Listener { id, rx }
    }

    pub(crate) fn remove(&self, event: &str, id: ListenerId) {
        let mut handlers = self.lock();
        if let Some(bound) = handlers.get_mut(event) {
            bound.retain(|(bound_id, _)| *bound_id != id);
            if bound.is_empty() {
                handlers.remove(event);
            }
        }
        trace!(event, ?id, "listener unbound");
    }

    /// Delivers a payload to every live handler of `event`, pruning handlers
    /// whose receiver was dropped. Returns the number of deliveries.
    pub(crate) fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let mut handlers = self.lock();
        let Some(bound) = handlers.get_mut(event) else {
            return 0;
        };
        bound.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        bound.len()
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.lock().get(event).map(Vec::len).unwrap_or(0)
    }

    fn lock(
        &self,
    ) -> MutexGuard<'_, HashMap<String, Vec<(ListenerId, mpsc::UnboundedSender<Value>)>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static SHARED: OnceCell<Arc<SocketTransport>> = OnceCell::const_new();

/// The process-wide realtime connection, established on first use and reused
/// by every conversation view afterwards. Later calls ignore `url`.
pub async fn shared(url: &str) -> Result<Arc<SocketTransport>, TransportError> {
    SHARED
        .get_or_try_init(|| async {
            info!(url, "establishing shared realtime connection");
            SocketTransport::connect(url).await.map(Arc::new)
        })
        .await
        .cloned()
}
