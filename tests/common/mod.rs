#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use huddle::{
    api::HistoryProvider,
    bus::EventBus,
    entity::{Identity, Participant},
    error::HistoryError,
    protocol::NEW_DIRECT_MESSAGE,
    ChatSession, ConversationKey, ConversationStore, DeliveryState, Message, MessageId,
};
use huddle::transport::MemoryTransport;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

type HistoryReply = Result<Vec<Message>, HistoryError>;

/// History provider whose answers are released by the test.
#[derive(Default)]
pub struct GatedHistory {
    gates: Mutex<HashMap<ConversationKey, oneshot::Receiver<HistoryReply>>>,
    requests: AtomicUsize,
}

impl GatedHistory {
    /// The next fetch of `key` waits until the returned sender fires.
    pub fn gate(&self, key: &ConversationKey) -> oneshot::Sender<HistoryReply> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(key.clone(), rx);
        tx
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryProvider for GatedHistory {
    async fn fetch_history(&self, key: &ConversationKey) -> HistoryReply {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().remove(key);
        match gate {
            Some(rx) => rx.await.unwrap_or_else(|_| Ok(Vec::new())),
            None => Ok(Vec::new()),
        }
    }
}

pub struct Harness {
    pub session: ChatSession,
    pub transport: Arc<MemoryTransport>,
    pub history: Arc<GatedHistory>,
    pub bus: Arc<EventBus>,
}

pub fn harness() -> Harness {
    let transport = Arc::new(MemoryTransport::new());
    let history = Arc::new(GatedHistory::default());
    let bus = Arc::new(EventBus::new());
    let store = ConversationStore::new(bus.clone());
    let identity = Identity::new(Participant::new("u1", "Kyle"));
    let session = ChatSession::new(identity, transport.clone(), history.clone(), store);
    Harness {
        session,
        transport,
        history,
        bus,
    }
}

pub fn dm(peer: &str) -> ConversationKey {
    ConversationKey::direct("u1", peer)
}

/// Backend chat record of a direct message.
pub fn record(id: &str, from: &str, to: &str, text: &str) -> Value {
    json!({
        "id": id,
        "userId": from,
        "friendId": to,
        "text": text,
        "type": "text",
        "user": {"id": from}
    })
}

pub fn ack_body(id: &str, from: &str, to: &str, text: &str) -> Value {
    json!({
        "message": "Send direct message successfully",
        "chat": record(id, from, to, text)
    })
}

pub fn push_body(id: &str, from: &str, to: &str, text: &str) -> Value {
    json!({
        "message": NEW_DIRECT_MESSAGE,
        "user": {"id": from},
        "friend": {"id": to},
        "chat": record(id, from, to, text)
    })
}

pub fn stored(id: &str, key: &ConversationKey, sender: &str, text: &str) -> Message {
    Message {
        id: MessageId::Confirmed(id.to_string()),
        conversation: key.clone(),
        sender_id: sender.into(),
        text: Some(text.to_string()),
        attachment: None,
        sent_at: Utc::now(),
        delivery: DeliveryState::Confirmed,
    }
}

pub fn ids(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|m| match &m.id {
            MessageId::Confirmed(id) => id.clone(),
            MessageId::Placeholder(_) => "<pending>".to_string(),
        })
        .collect()
}

/// Polls `check` until it holds, yielding to spawned tasks in between.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Gives spawned tasks a chance to run without expecting any change.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
