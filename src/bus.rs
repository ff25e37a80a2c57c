use crate::chat::{ConversationKey, DeliveryState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A conversation's message sequence was mutated
    ConversationChanged {
        key: ConversationKey,
        revision: u64,
    },

    /// A local send left the pending state
    DeliveryChanged {
        key: ConversationKey,
        token: Uuid,
        state: DeliveryState,
    },

    /// Stored history was merged into a conversation
    HistoryLoaded { key: ConversationKey, count: usize },

    /// Stored history could not be fetched; the conversation stays as is
    HistoryFailed { key: ConversationKey, reason: String },

    /// Free-form notice for the user (connection lost, etc.)
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

impl Event {
    pub fn key(&self) -> Option<&ConversationKey> {
        match self {
            Event::ConversationChanged { key, .. }
            | Event::DeliveryChanged { key, .. }
            | Event::HistoryLoaded { key, .. }
            | Event::HistoryFailed { key, .. } => Some(key),
            Event::Notification { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
