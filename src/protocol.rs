//! JSON shapes exchanged with the chat backend, over both the realtime
//! channel and the REST API.

use crate::{
    chat::{Attachment, AttachmentKind, ConversationKey, DeliveryState, Message, MessageId, Outgoing},
    entity::{Participant, ParticipantId},
    error::TransportError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const SEND_DIRECT_MESSAGE: &str = "send_direct_message";
pub const RECEIVE_DIRECT_MESSAGE: &str = "receive_direct_message";
pub const SEND_CHANNEL_MESSAGE: &str = "send_channel_message";
pub const RECEIVE_CHANNEL_MESSAGE: &str = "receive_channel_message";

pub const NEW_DIRECT_MESSAGE: &str = "You have new direct message";
pub const NEW_CHANNEL_MESSAGE: &str = "You have new channel message";

pub fn send_event(key: &ConversationKey) -> &'static str {
    match key {
        ConversationKey::Direct { .. } => SEND_DIRECT_MESSAGE,
        ConversationKey::Channel(_) => SEND_CHANNEL_MESSAGE,
    }
}

pub fn receive_event(key: &ConversationKey) -> &'static str {
    match key {
        ConversationKey::Direct { .. } => RECEIVE_DIRECT_MESSAGE,
        ConversationKey::Channel(_) => RECEIVE_CHANNEL_MESSAGE,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("chat record has no id")]
    MissingId,
    #[error("chat record {0} has no sender")]
    MissingSender(String),
    #[error("chat record {0} names no conversation")]
    MissingConversation(String),
}

/// A chat entry as the backend stores it. Direct messages carry
/// `userId`/`friendId`, channel messages carry `channelId`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub friend_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub sended: Option<String>,
    #[serde(default)]
    pub user: Option<Value>,
}

impl ChatRecord {
    /// The embedded author profile, when the backend included a usable one.
    pub fn author(&self) -> Option<Participant> {
        serde_json::from_value(self.user.clone()?).ok()
    }

    /// Converts a backend record into a confirmed message. `fallback` supplies
    /// the conversation when the record does not name one (terse
    /// acknowledgments).
    pub fn into_message(self, fallback: Option<&ConversationKey>) -> Result<Message, RecordError> {
        let id = self.id.clone().ok_or(RecordError::MissingId)?;

        let sender_id = self
            .user_id
            .clone()
            .map(ParticipantId::from)
            .or_else(|| self.author().map(|author| author.id))
            .ok_or_else(|| RecordError::MissingSender(id.clone()))?;

        let conversation = match (&self.channel_id, &self.friend_id) {
            (Some(channel), _) => ConversationKey::channel(channel.clone()),
            (None, Some(friend)) => ConversationKey::direct(sender_id.clone(), friend.clone()),
            (None, None) => fallback
                .cloned()
                .ok_or_else(|| RecordError::MissingConversation(id.clone()))?,
        };

        let attachment = self.url.clone().filter(|url| !url.is_empty()).map(|url| {
            let mut attachment = match self.file_name.clone() {
                Some(file_name) => Attachment::new(url, file_name),
                None => Attachment::from_url(url),
            };
            if let Some(kind) = self.kind.as_deref().filter(|k| *k != "file") {
                attachment.kind = AttachmentKind::parse(kind);
            }
            attachment
        });

        let sent_at = self
            .sended
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Message {
            id: MessageId::Confirmed(id),
            conversation,
            sender_id,
            text: self.text.filter(|text| !text.is_empty()),
            attachment,
            sent_at,
            delivery: DeliveryState::Confirmed,
        })
    }
}

/// Body of a send request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friend_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Client correlation token; echoed back by backends that support it
    pub token: Uuid,
}

impl SendRequest {
    pub fn new(
        key: &ConversationKey,
        sender: &ParticipantId,
        token: Uuid,
        outgoing: &Outgoing,
    ) -> Self {
        let (friend_id, channel_id) = match key {
            ConversationKey::Direct { .. } => {
                (key.peer_of(sender).map(|peer| peer.to_string()), None)
            }
            ConversationKey::Channel(channel) => (None, Some(channel.clone())),
        };

        let (text, attachment) = outgoing.clone().into_parts();
        let kind = if attachment.is_some() { "file" } else { "text" };

        Self {
            user_id: sender.to_string(),
            friend_id,
            channel_id,
            text,
            kind,
            url: attachment.as_ref().map(|a| a.url.clone()),
            file_name: attachment.map(|a| a.file_name),
            token,
        }
    }
}

/// `{ message, user, friend, chat }` wrapper used by acknowledgments and
/// pushes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub friend: Option<Value>,
    #[serde(default)]
    pub chat: Option<ChatRecord>,
}

/// Reads a send acknowledgment: a `chat` record means the backend accepted
/// the message, anything else is a rejection carrying `message`.
pub fn parse_ack(body: Value) -> Result<ChatRecord, TransportError> {
    let envelope: Envelope = serde_json::from_value(body)?;
    match envelope.chat {
        Some(chat) => Ok(chat),
        None if envelope.message.is_empty() => {
            Err(TransportError::Rejected("acknowledgment carried no chat".into()))
        }
        None => Err(TransportError::Rejected(envelope.message)),
    }
}

/// Reads a push event, accepting it only when it announces a new message and
/// carries both the chat record and its author.
pub fn parse_push(event: &str, body: &Value) -> Option<ChatRecord> {
    let expected = match event {
        RECEIVE_DIRECT_MESSAGE => NEW_DIRECT_MESSAGE,
        RECEIVE_CHANNEL_MESSAGE => NEW_CHANNEL_MESSAGE,
        _ => return None,
    };
    let envelope: Envelope = serde_json::from_value(body.clone()).ok()?;
    if envelope.message != expected || envelope.user.is_none() {
        return None;
    }
    envelope.chat
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
