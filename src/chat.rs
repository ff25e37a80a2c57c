use crate::entity::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Selects a direct-message thread or a server channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ConversationKey {
    /// Participant pair, stored in sorted order so both sides agree on the key.
    Direct { a: ParticipantId, b: ParticipantId },
    Channel(String),
}

impl ConversationKey {
    pub fn direct(first: impl Into<ParticipantId>, second: impl Into<ParticipantId>) -> Self {
        let (first, second) = (first.into(), second.into());
        if first <= second {
            Self::Direct { a: first, b: second }
        } else {
            Self::Direct { a: second, b: first }
        }
    }

    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self::Channel(channel_id.into())
    }

    /// The other side of a direct thread, seen from `me`.
    pub fn peer_of(&self, me: &ParticipantId) -> Option<&ParticipantId> {
        match self {
            Self::Direct { a, b } if a == me => Some(b),
            Self::Direct { a, b } if b == me => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { a, b } => write!(f, "dm:{}+{}", a, b),
            Self::Channel(id) => write!(f, "channel:{}", id),
        }
    }
}

/// Either a client correlation token (not yet acknowledged) or the id the
/// backend assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageId {
    Placeholder(Uuid),
    Confirmed(String),
}

impl MessageId {
    pub fn confirmed(&self) -> Option<&str> {
        match self {
            Self::Confirmed(id) => Some(id),
            Self::Placeholder(_) => None,
        }
    }

    pub fn is_placeholder_for(&self, token: Uuid) -> bool {
        matches!(self, Self::Placeholder(t) if *t == token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "sending",
            Self::Confirmed => "sent",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Text,
    Image,
    Video,
    Audio,
    Pdf,
    File,
}

impl AttachmentKind {
    /// Classifies an uploaded file by the MIME type guessed from its name.
    pub fn from_file_name(file_name: &str) -> Self {
        let Some(mime) = mime_guess::from_path(file_name).first() else {
            return Self::File;
        };

        match (mime.type_().as_str(), mime.subtype().as_str()) {
            ("application", "pdf") => Self::Pdf,
            ("image", _) => Self::Image,
            ("video", _) => Self::Video,
            ("audio", _) => Self::Audio,
            ("text", _) => Self::Text,
            _ => Self::File,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Pdf => "pdf",
            Self::File => "file",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "text" => Self::Text,
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            "pdf" => Self::Pdf,
            _ => Self::File,
        }
    }
}

/// Reference to a file already stored by the upload service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub file_name: String,
    pub kind: AttachmentKind,
}

impl Attachment {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        Self {
            kind: AttachmentKind::from_file_name(&file_name),
            url: url.into(),
            file_name,
        }
    }

    /// Builds a reference from a bare URL, taking the last path segment as the
    /// file name.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let file_name = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .unwrap_or("attachment")
            .to_string();
        Self::new(url, file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation: ConversationKey,
    pub sender_id: ParticipantId,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub sent_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl Message {
    /// A locally authored message awaiting acknowledgment.
    pub fn placeholder(
        token: Uuid,
        conversation: ConversationKey,
        sender_id: ParticipantId,
        outgoing: &Outgoing,
    ) -> Self {
        let (text, attachment) = outgoing.clone().into_parts();
        Self {
            id: MessageId::Placeholder(token),
            conversation,
            sender_id,
            text,
            attachment,
            sent_at: Utc::now(),
            delivery: DeliveryState::Pending,
        }
    }

    pub fn confirmed_id(&self) -> Option<&str> {
        self.id.confirmed()
    }

    pub fn token(&self) -> Option<Uuid> {
        match self.id {
            MessageId::Placeholder(token) => Some(token),
            MessageId::Confirmed(_) => None,
        }
    }

    /// What the user originally submitted, used to resubmit a failed message.
    pub fn outgoing(&self) -> Option<Outgoing> {
        match (&self.attachment, &self.text) {
            (Some(attachment), _) => Some(Outgoing::Attachment(attachment.clone())),
            (None, Some(text)) => Some(Outgoing::Text(text.clone())),
            (None, None) => None,
        }
    }

    /// Copy of this message in a terminal failure state.
    pub fn failed(&self) -> Self {
        Self {
            delivery: DeliveryState::Failed,
            ..self.clone()
        }
    }
}

/// Content staged by the user before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Attachment(Attachment),
}

impl Outgoing {
    pub fn into_parts(self) -> (Option<String>, Option<Attachment>) {
        match self {
            Self::Text(text) => (Some(text), None),
            Self::Attachment(attachment) => (None, Some(attachment)),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Attachment(attachment) => attachment.url.trim().is_empty(),
        }
    }
}
