use crate::chat::ConversationKey;
use thiserror::Error;

/// Failures of the realtime channel. Scoped to one request; never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("realtime connection is not available")]
    Disconnected,

    #[error("backend rejected the request: {0}")]
    Rejected(String),

    #[error("no acknowledgment within {0} ms")]
    Timeout(u64),

    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("malformed frame: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no matching message in {0}")]
    NotFound(ConversationKey),

    #[error("message in {0} already reached a final delivery state")]
    Terminal(ConversationKey),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("history endpoint answered {0}")]
    Status(reqwest::StatusCode),

    #[error("history request rejected: {0}")]
    Rejected(String),
}

/// Returned synchronously by the session when nothing was submitted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Message can not be empty")]
    EmptyMessage,

    #[error("no conversation is active")]
    NoActiveConversation,

    #[error("message is not in a failed state")]
    NotRetryable,
}
