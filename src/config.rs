use crate::entity::{Identity, Participant, ParticipantId};
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_url: String,
    pub socket_url: String,
    pub user_id: ParticipantId,
    pub user_name: Option<String>,
    /// `None` leaves unacknowledged sends pending indefinitely.
    pub ack_timeout: Option<Duration>,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = var("HUDDLE_API_URL")
            .context("HUDDLE_API_URL must point at the chat backend")?
            .trim_end_matches('/')
            .to_string();

        let socket_url = match var("HUDDLE_SOCKET_URL") {
            Some(url) => url,
            None => socket_url_for(&api_url)?,
        };

        let user_id = var("HUDDLE_USER_ID")
            .map(ParticipantId::new)
            .context("HUDDLE_USER_ID must name the signed-in user")?;

        let ack_timeout = var("HUDDLE_ACK_TIMEOUT_MS")
            .map(|raw| {
                raw.parse::<u64>()
                    .with_context(|| format!("HUDDLE_ACK_TIMEOUT_MS is not a number: {}", raw))
            })
            .transpose()?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let http_timeout = var("HUDDLE_HTTP_TIMEOUT_SECS")
            .map(|raw| {
                raw.parse::<u64>()
                    .with_context(|| format!("HUDDLE_HTTP_TIMEOUT_SECS is not a number: {}", raw))
            })
            .transpose()?
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);

        Ok(Self {
            api_url,
            socket_url,
            user_id,
            user_name: var("HUDDLE_USER_NAME"),
            ack_timeout,
            http_timeout: Duration::from_secs(http_timeout),
        })
    }

    pub fn identity(&self) -> Identity {
        Identity::new(Participant {
            id: self.user_id.clone(),
            name: self.user_name.clone(),
            avatar: None,
        })
    }
}

/// `http://host/api` => `ws://host/api`, `https://..` => `wss://..`
fn socket_url_for(api_url: &str) -> Result<String> {
    if let Some(rest) = api_url.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else {
        bail!("cannot derive a websocket URL from {}; set HUDDLE_SOCKET_URL", api_url)
    }
}
