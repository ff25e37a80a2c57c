use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One websocket text frame exchanged with the realtime endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    /// Client or server initiated event; `ack` is set when an answer is expected
    Emit {
        event: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    /// Answer to an `Emit` carrying the same `ack` number
    Ack {
        ack: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Server push with no answer expected
    Event { event: String, data: Value },
}

impl Frame {
    pub fn emit(event: &str, data: Value, ack: u64) -> Self {
        Frame::Emit {
            event: event.to_string(),
            data,
            ack: Some(ack),
        }
    }

    pub fn parse(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }
}
