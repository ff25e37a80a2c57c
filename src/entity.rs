use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a user account on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Public profile of a participant, as embedded in chat records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ParticipantId::new(id),
            name: Some(name.into()),
            avatar: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }

    /// Letter shown in place of a missing avatar.
    pub fn initial(&self) -> String {
        summary_initial(self.display_name())
    }
}

/// The locally signed-in participant, supplied by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant: Participant,
}

impl Identity {
    pub fn new(participant: Participant) -> Self {
        Self { participant }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.participant.id
    }
}

/// "Minh Trí" => "T", "Kyle" => "K".
pub fn summary_initial(name: &str) -> String {
    let last = name.split_whitespace().last().unwrap_or("");
    last.chars().next().map(|c| c.to_string()).unwrap_or_default()
}
