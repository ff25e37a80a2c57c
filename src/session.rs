use crate::{
    api::HistoryProvider,
    bus::{Event, NotificationLevel},
    chat::{ConversationKey, DeliveryState, Message, Outgoing},
    entity::Identity,
    error::{SendError, StoreError, TransportError},
    protocol::{self, SendRequest},
    store::ConversationStore,
    transport::{Ack, Listener, ListenerId, Transport},
};
use futures::stream::Stream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Bindings that live exactly as long as one conversation is on screen.
struct ActiveView {
    key: ConversationKey,
    event: &'static str,
    listener: ListenerId,
    push_task: JoinHandle<()>,
    history_task: JoinHandle<()>,
}

/// Keeps one conversation's transcript consistent while local sends, their
/// acknowledgments, and server pushes arrive in any order.
///
/// Every mutation goes through the [`ConversationStore`]; renderers only read
/// snapshots or subscribe to changes.
pub struct ChatSession {
    identity: Identity,
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryProvider>,
    store: ConversationStore,
    ack_timeout: Option<Duration>,
    generation: Arc<AtomicU64>,
    active: Option<ActiveView>,
}

impl ChatSession {
    pub fn new(
        identity: Identity,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryProvider>,
        store: ConversationStore,
    ) -> Self {
        Self {
            identity,
            transport,
            history,
            store,
            ack_timeout: None,
            generation: Arc::new(AtomicU64::new(0)),
            active: None,
        }
    }

    /// Fails sends that stay unacknowledged for longer than `timeout`.
    /// Without it a send waits until the connection drops.
    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn active(&self) -> Option<&ConversationKey> {
        self.active.as_ref().map(|view| &view.key)
    }

    /// Opens `key`: drops the previous view's bindings, binds the push
    /// listener, then requests stored history once.
    pub fn activate(&mut self, key: ConversationKey) {
        self.deactivate();

        let epoch = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.store.reset(&key);

        // Bind before requesting history so pushes racing the fetch are kept
        let event = protocol::receive_event(&key);
        let listener = self.transport.on(event);
        let listener_id = listener.id();
        let push_task = tokio::spawn(listen(listener, event, key.clone(), self.store.clone()));

        let history_task = tokio::spawn(load_history(
            self.history.clone(),
            self.store.clone(),
            key.clone(),
            self.generation.clone(),
            epoch,
        ));

        info!(%key, "conversation activated");
        self.active = Some(ActiveView {
            key,
            event,
            listener: listener_id,
            push_task,
            history_task,
        });
    }

    /// Stops listening for the current conversation. In-flight sends still
    /// reconcile into the conversation they were sent from.
    pub fn deactivate(&mut self) {
        let Some(view) = self.active.take() else {
            return;
        };

        self.generation.fetch_add(1, Ordering::AcqRel);
        self.transport.off(view.event, view.listener);
        view.push_task.abort();
        view.history_task.abort();
        info!(key = %view.key, "conversation deactivated");
    }

    /// Submits a message to the active conversation and returns its
    /// correlation token. Returns before the backend answers; the outcome
    /// shows up as the message's delivery state.
    pub fn send(&self, outgoing: Outgoing) -> Result<Uuid, SendError> {
        if outgoing.is_blank() {
            return Err(SendError::EmptyMessage);
        }
        let key = self.active_key()?.clone();
        Ok(self.submit(key, outgoing))
    }

    /// Resubmits a failed message as a new send. The failed entry stays in
    /// the transcript.
    pub fn retry(&self, token: Uuid) -> Result<Uuid, SendError> {
        let key = self.active_key()?.clone();
        let failed = self
            .store
            .find(&key, |m| {
                m.id.is_placeholder_for(token) && m.delivery == DeliveryState::Failed
            })
            .ok_or(SendError::NotRetryable)?;
        let outgoing = failed.outgoing().ok_or(SendError::NotRetryable)?;

        debug!(%key, %token, "retrying failed message");
        Ok(self.submit(key, outgoing))
    }

    /// Token of the most recent failed message in the active conversation.
    pub fn last_failed(&self) -> Option<Uuid> {
        let key = self.active()?;
        self.store
            .snapshot(key)
            .iter()
            .rev()
            .find(|m| m.delivery == DeliveryState::Failed)
            .and_then(Message::token)
    }

    pub fn snapshot(&self, key: &ConversationKey) -> Vec<Message> {
        self.store.snapshot(key)
    }

    /// Calls `on_change` with a fresh snapshot after every mutation of `key`
    /// until the returned handle is dropped.
    pub fn subscribe<F>(&self, key: ConversationKey, on_change: F) -> Subscription
    where
        F: Fn(Vec<Message>) + Send + 'static,
    {
        let mut rx = self.store.bus().subscribe();
        let store = self.store.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::ConversationChanged { key: changed, .. }) if changed == key => {
                        on_change(store.snapshot(&key));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "subscriber lagged, resyncing");
                        on_change(store.snapshot(&key));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Subscription { task }
    }

    /// Stream of snapshots of `key`, one per mutation.
    pub fn changes(&self, key: ConversationKey) -> impl Stream<Item = Vec<Message>> {
        let mut rx = self.store.bus().subscribe();
        let store = self.store.clone();

        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(Event::ConversationChanged { key: changed, .. }) if changed == key => {
                        yield store.snapshot(&key);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        yield store.snapshot(&key);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    fn active_key(&self) -> Result<&ConversationKey, SendError> {
        self.active().ok_or(SendError::NoActiveConversation)
    }

    fn submit(&self, key: ConversationKey, outgoing: Outgoing) -> Uuid {
        let token = Uuid::new_v4();
        let sender = self.identity.id().clone();
        let placeholder = Message::placeholder(token, key.clone(), sender.clone(), &outgoing);
        self.store.append(&key, placeholder.clone());

        let request = SendRequest::new(&key, &sender, token, &outgoing);
        let ack = match serde_json::to_value(&request) {
            Ok(payload) => self.transport.emit(protocol::send_event(&key), payload),
            Err(e) => Ack::ready(Err(e.into())),
        };
        debug!(%key, %token, "message submitted");

        let reconciler = Reconciler {
            store: self.store.clone(),
            key,
            placeholder,
            timeout: self.ack_timeout,
        };
        tokio::spawn(reconciler.run(ack));
        token
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Change subscription; dropping it unsubscribes.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Settles one submitted message once its acknowledgment arrives.
struct Reconciler {
    store: ConversationStore,
    key: ConversationKey,
    placeholder: Message,
    timeout: Option<Duration>,
}

impl Reconciler {
    async fn run(self, ack: Ack) {
        let answer = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, ack.wait()).await {
                Ok(answer) => answer,
                Err(_) => Err(timed_out(limit)),
            },
            None => ack.wait().await,
        };

        let outcome = answer.and_then(protocol::parse_ack).and_then(|mut record| {
            // An accepted send is always ours, even when the record omits its author
            if record.user_id.is_none() && record.author().is_none() {
                record.user_id = Some(self.placeholder.sender_id.to_string());
            }
            record
                .into_message(Some(&self.key))
                .map_err(|e| TransportError::Codec(e.to_string()))
        });

        match outcome {
            Ok(message) => self.confirm(message),
            Err(e) => self.fail(e),
        }
    }

    fn token(&self) -> Uuid {
        self.placeholder.token().unwrap_or_default()
    }

    fn confirm(&self, mut message: Message) {
        let token = self.token();
        if message.conversation != self.key {
            debug!(key = %self.key, acked = %message.conversation, "acknowledgment named another conversation");
            message.conversation = self.key.clone();
        }

        if let Err(e) = self
            .store
            .replace(&self.key, |m| m.id.is_placeholder_for(token), message.clone())
        {
            warn!(key = %self.key, %token, "Placeholder missing at acknowledgment, appending: {}", e);
            self.store.append(&self.key, message);
        }
        self.store.dedupe(&self.key);

        trace!(key = %self.key, %token, "message confirmed");
        self.publish(DeliveryState::Confirmed);
    }

    fn fail(&self, error: TransportError) {
        let token = self.token();
        warn!(key = %self.key, %token, "Message not delivered: {}", error);

        match self.store.replace(
            &self.key,
            |m| m.id.is_placeholder_for(token),
            self.placeholder.failed(),
        ) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                warn!(key = %self.key, %token, "Placeholder missing at failure, appending");
                self.store.append(&self.key, self.placeholder.failed());
            }
            Err(e) => warn!(key = %self.key, %token, "Could not mark message failed: {}", e),
        }

        self.publish(DeliveryState::Failed);
        self.store.bus().publish(Event::Notification {
            level: NotificationLevel::Error,
            message: format!("message not delivered: {}", error),
        });
    }

    fn publish(&self, state: DeliveryState) {
        self.store.bus().publish(Event::DeliveryChanged {
            key: self.key.clone(),
            token: self.token(),
            state,
        });
    }
}

fn timed_out(limit: Duration) -> TransportError {
    TransportError::Timeout(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
}

async fn listen(
    mut listener: Listener,
    event: &'static str,
    key: ConversationKey,
    store: ConversationStore,
) {
    while let Some(payload) = listener.recv().await {
        let Some(record) = protocol::parse_push(event, &payload) else {
            debug!(event, "ignoring push without a new message");
            continue;
        };

        let message = match record.into_message(None) {
            Ok(message) => message,
            Err(e) => {
                warn!(%key, "Ignoring unreadable push: {}", e);
                continue;
            }
        };

        if message.conversation != key {
            trace!(%key, other = %message.conversation, "push for another conversation");
            continue;
        }

        store.append(&key, message);
        store.dedupe(&key);
    }
    debug!(%key, "push listener stopped");
}

async fn load_history(
    history: Arc<dyn HistoryProvider>,
    store: ConversationStore,
    key: ConversationKey,
    generation: Arc<AtomicU64>,
    epoch: u64,
) {
    let result = history.fetch_history(&key).await;

    if generation.load(Ordering::Acquire) != epoch {
        debug!(%key, "discarding history of an inactive conversation");
        return;
    }

    match result {
        Ok(messages) => {
            let count = messages.len();
            store.extend(&key, messages);
            store.dedupe(&key);
            info!(%key, count, "history loaded");
            store.bus().publish(Event::HistoryLoaded { key, count });
        }
        Err(e) => {
            warn!(%key, "Failed to load history: {}", e);
            store.bus().publish(Event::HistoryFailed {
                key,
                reason: e.to_string(),
            });
        }
    }
}
