use crate::{
    bus::{Event, EventBus},
    chat::{ConversationKey, DeliveryState, Message},
    error::StoreError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<Message>,
    revision: u64,
}

/// In-memory message log per conversation.
///
/// Cloning is cheap and every clone sees the same conversations. Each mutation
/// publishes [`Event::ConversationChanged`] once the lock is released.
#[derive(Clone)]
pub struct ConversationStore {
    conversations: Arc<Mutex<HashMap<ConversationKey, Conversation>>>,
    bus: Arc<EventBus>,
}

impl ConversationStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            conversations: Arc::new(Mutex::new(HashMap::new())),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Adds a message to the end of the conversation.
    pub fn append(&self, key: &ConversationKey, message: Message) {
        let revision = {
            let mut conversations = self.lock();
            let conversation = conversations.entry(key.clone()).or_default();
            conversation.messages.push(message);
            bump(conversation)
        };
        self.changed(key, revision);
    }

    /// Appends a whole batch as a single mutation, keeping the batch order.
    pub fn extend(&self, key: &ConversationKey, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let revision = {
            let mut conversations = self.lock();
            let conversation = conversations.entry(key.clone()).or_default();
            conversation.messages.extend(messages);
            bump(conversation)
        };
        self.changed(key, revision);
    }

    /// Replaces the first message matching `predicate`, keeping its position.
    ///
    /// Messages that already reached `Confirmed` or `Failed` are never
    /// replaced.
    pub fn replace<P>(
        &self,
        key: &ConversationKey,
        predicate: P,
        message: Message,
    ) -> Result<(), StoreError>
    where
        P: Fn(&Message) -> bool,
    {
        let revision = {
            let mut conversations = self.lock();
            let conversation = conversations
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let slot = conversation
                .messages
                .iter_mut()
                .find(|m| predicate(m))
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;

            if slot.delivery.is_terminal() {
                return Err(StoreError::Terminal(key.clone()));
            }

            *slot = message;
            bump(conversation)
        };
        self.changed(key, revision);
        Ok(())
    }

    /// Drops every message whose confirmed id was already seen earlier in the
    /// conversation. Placeholders are never collapsed. Returns how many
    /// messages were removed.
    pub fn dedupe(&self, key: &ConversationKey) -> usize {
        let (removed, revision) = {
            let mut conversations = self.lock();
            let Some(conversation) = conversations.get_mut(key) else {
                return 0;
            };

            let before = conversation.messages.len();
            let mut seen = HashSet::new();
            conversation.messages.retain(|message| match message.confirmed_id() {
                Some(id) => seen.insert(id.to_string()),
                None => true,
            });
            let removed = before - conversation.messages.len();
            if removed == 0 {
                return 0;
            }
            (removed, bump(conversation))
        };

        trace!(%key, removed, "collapsed duplicate messages");
        self.changed(key, revision);
        removed
    }

    /// Current ordered sequence; empty for unknown conversations.
    pub fn snapshot(&self, key: &ConversationKey) -> Vec<Message> {
        self.lock()
            .get(key)
            .map(|conversation| conversation.messages.clone())
            .unwrap_or_default()
    }

    pub fn find<P>(&self, key: &ConversationKey, predicate: P) -> Option<Message>
    where
        P: Fn(&Message) -> bool,
    {
        self.lock()
            .get(key)
            .and_then(|conversation| conversation.messages.iter().find(|m| predicate(m)).cloned())
    }

    /// Clears a conversation for a fresh load. Sends still awaiting their
    /// acknowledgment survive so they can settle in place.
    pub fn reset(&self, key: &ConversationKey) {
        let revision = {
            let mut conversations = self.lock();
            let conversation = conversations.entry(key.clone()).or_default();
            conversation
                .messages
                .retain(|m| m.delivery == DeliveryState::Pending);
            bump(conversation)
        };
        self.changed(key, revision);
    }

    /// Forgets a conversation entirely.
    pub fn discard(&self, key: &ConversationKey) {
        self.lock().remove(key);
    }

    pub fn revision(&self, key: &ConversationKey) -> u64 {
        self.lock().get(key).map(|c| c.revision).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationKey, Conversation>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self, key: &ConversationKey, revision: u64) {
        self.bus.publish(Event::ConversationChanged {
            key: key.clone(),
            revision,
        });
    }
}

fn bump(conversation: &mut Conversation) -> u64 {
    conversation.revision += 1;
    conversation.revision
}
