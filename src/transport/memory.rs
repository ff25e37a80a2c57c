use super::{Ack, Listener, ListenerId, Listeners, Transport};
use crate::error::TransportError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// An event handed to [`MemoryTransport::emit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub seq: u64,
    pub event: String,
    pub payload: Value,
}

#[derive(Default)]
struct State {
    offline: bool,
    next_seq: u64,
    emitted: Vec<Emitted>,
    outstanding: HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>,
}

/// In-process transport driven by its owner: emitted events are recorded and
/// acknowledged explicitly, pushes are injected with [`MemoryTransport::push`].
///
/// Used when running without a realtime endpoint and to script delivery races.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
    listeners: Listeners,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Going offline settles every outstanding acknowledgment as disconnected
    /// and makes later emits fail immediately.
    pub fn set_offline(&self, offline: bool) {
        let dropped: Vec<_> = {
            let mut state = self.lock();
            state.offline = offline;
            if offline {
                state.outstanding.drain().map(|(_, tx)| tx).collect()
            } else {
                Vec::new()
            }
        };
        for tx in dropped {
            let _ = tx.send(Err(TransportError::Disconnected));
        }
    }

    pub fn emitted(&self) -> Vec<Emitted> {
        self.lock().emitted.clone()
    }

    pub fn last_emitted(&self) -> Option<Emitted> {
        self.lock().emitted.last().cloned()
    }

    /// Settles the acknowledgment of emit number `seq`. Returns `false` if it
    /// was already settled or never existed.
    pub fn acknowledge(&self, seq: u64, result: Result<Value, TransportError>) -> bool {
        let sender = self.lock().outstanding.remove(&seq);
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Delivers a server push to every listener bound to `event`.
    pub fn push(&self, event: &str, payload: Value) -> usize {
        self.listeners.dispatch(event, &payload)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.count(event)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    fn emit(&self, event: &str, payload: Value) -> Ack {
        let mut state = self.lock();
        if state.offline {
            debug!(event, "emit while offline");
            return Ack::ready(Err(TransportError::Disconnected));
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        state.emitted.push(Emitted {
            seq,
            event: event.to_string(),
            payload,
        });

        let (tx, ack) = Ack::channel();
        state.outstanding.insert(seq, tx);
        ack
    }

    fn on(&self, event: &str) -> Listener {
        self.listeners.add(event)
    }

    fn off(&self, event: &str, id: ListenerId) {
        self.listeners.remove(event, id);
    }
}
