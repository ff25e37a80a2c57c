use crate::{
    chat::{ConversationKey, Message},
    config::Config,
    entity::{Participant, ParticipantId},
    error::HistoryError,
    protocol::ChatRecord,
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

pub const DIRECT_HISTORY_OK: &str = "Get all direct messages successfully";
pub const CHANNEL_HISTORY_OK: &str = "Get all channel messages successfully";
pub const FIND_USER_OK: &str = "Find user sucessfully";

/// Source of a conversation's stored messages.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Stored messages of `key`, in the order the backend returns them.
    async fn fetch_history(&self, key: &ConversationKey) -> Result<Vec<Message>, HistoryError>;
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    message: String,
    #[serde(default)]
    chats: Vec<ChatRecord>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    #[serde(default)]
    message: String,
    #[serde(default)]
    user: Option<Participant>,
}

/// Thin client over the backend's REST API.
#[derive(Clone, Debug)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    viewer: ParticipantId,
}

impl RestClient {
    pub fn new(config: &Config) -> Result<Self, HistoryError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self::with_client(client, &config.api_url, config.user_id.clone()))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, viewer: ParticipantId) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            viewer,
        }
    }

    /// Profile of another participant, used for display names.
    pub async fn fetch_user(&self, id: &ParticipantId) -> Result<Participant, HistoryError> {
        let url = format!("{}/user/id/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(HistoryError::Status(response.status()));
        }

        let body: UserResponse = response.json().await?;
        match body.user {
            Some(user) if body.message == FIND_USER_OK => Ok(user),
            _ => Err(HistoryError::Rejected(body.message)),
        }
    }
}

#[async_trait]
impl HistoryProvider for RestClient {
    async fn fetch_history(&self, key: &ConversationKey) -> Result<Vec<Message>, HistoryError> {
        let (request, expected) = match key {
            ConversationKey::Direct { .. } => {
                let friend = key
                    .peer_of(&self.viewer)
                    .ok_or_else(|| HistoryError::Rejected(format!("{} is not part of {}", self.viewer, key)))?;
                let request = self
                    .client
                    .get(format!("{}/message/direct", self.base_url))
                    .json(&serde_json::json!({
                        "userId": self.viewer,
                        "friendId": friend,
                    }));
                (request, DIRECT_HISTORY_OK)
            }
            ConversationKey::Channel(channel) => {
                let request = self
                    .client
                    .get(format!("{}/server/channel/chat/{}", self.base_url, channel))
                    .header("userId", self.viewer.as_str());
                (request, CHANNEL_HISTORY_OK)
            }
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(HistoryError::Status(response.status()));
        }

        let body: HistoryResponse = response.json().await?;
        if body.message != expected {
            return Err(HistoryError::Rejected(body.message));
        }

        let mut messages = Vec::with_capacity(body.chats.len());
        for record in body.chats {
            match record.into_message(Some(key)) {
                Ok(message) if &message.conversation == key => messages.push(message),
                Ok(message) => {
                    warn!(%key, other = %message.conversation, "history returned a record of another conversation");
                }
                Err(e) => warn!(%key, "Skipping unreadable history record: {}", e),
            }
        }

        debug!(%key, count = messages.len(), "history fetched");
        Ok(messages)
    }
}
