//! JSON wire protocol for taps.
//!
//! Wire format (one JSON object per event, newline terminated on write):
//! ```text
//! {"sequenceId":3,"kind":"message","user":"sean","conversation":"bananas","value":"Hey guys","args":[]}
//! ```
//!
//! The reader side does not depend on the newline: any whitespace between
//! objects is accepted (see [`crate::transport::TapCodec`]).

use serde::{Deserialize, Deserializer, Serialize};

/// Sender name stamped on server-originated `error` taps.
pub const SYSTEM_USER: &str = "system";

/// Closed set of tap kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// Session bootstrap; `value` optionally carries a resume cursor
    Auth,
    /// Create a conversation titled `conversation` with `args` as participants
    CreateConversation,
    /// Say `value` in `conversation`
    Message,
    /// Admit `args` into `conversation`
    Invite,
    /// Server-to-client failure notice
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::CreateConversation => "createConversation",
            Self::Message => "message",
            Self::Invite => "invite",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tap: one immutable, sequenced fact.
///
/// `sequence_id` is meaningless until the server commits the event; clients
/// leave it at zero and the serializer overwrites it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub sequence_id: u64,
    pub kind: EventKind,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub conversation: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, deserialize_with = "nullable_args")]
    pub args: Vec<String>,
}

/// Some peers encode an empty participant list as `null`.
fn nullable_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Event {
    fn new(kind: EventKind, user: impl Into<String>) -> Self {
        Self {
            sequence_id: 0,
            kind,
            user: user.into(),
            conversation: String::new(),
            value: String::new(),
            args: Vec::new(),
        }
    }

    /// Bootstrap tap. `resume_from` is the first log index the server should
    /// scan from.
    pub fn auth(user: impl Into<String>, resume_from: u64) -> Self {
        let mut event = Self::new(EventKind::Auth, user);
        event.value = resume_from.to_string();
        event
    }

    pub fn create_conversation(
        user: impl Into<String>,
        title: impl Into<String>,
        first_message: impl Into<String>,
        participants: Vec<String>,
    ) -> Self {
        let mut event = Self::new(EventKind::CreateConversation, user);
        event.conversation = title.into();
        event.value = first_message.into();
        event.args = participants;
        event
    }

    pub fn message(
        user: impl Into<String>,
        conversation: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(EventKind::Message, user);
        event.conversation = conversation.into();
        event.value = body.into();
        event
    }

    pub fn invite(
        user: impl Into<String>,
        conversation: impl Into<String>,
        invitees: Vec<String>,
    ) -> Self {
        let mut event = Self::new(EventKind::Invite, user);
        event.conversation = conversation.into();
        event.args = invitees;
        event
    }

    /// Error notice sent by the server before it drops a connection.
    pub fn error(reason: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::Error, SYSTEM_USER);
        event.value = reason.into();
        event
    }

    /// Resume cursor carried by an auth tap. Empty or unparsable values
    /// start from the beginning of the log.
    pub fn resume_cursor(&self) -> u64 {
        self.value.trim().parse().unwrap_or(0)
    }

    /// Whether this is an invite naming `user` as one of its invitees.
    pub fn invites(&self, user: &str) -> bool {
        self.kind == EventKind::Invite && self.args.iter().any(|a| a == user)
    }

    /// Serialize to a single JSON object (no trailing newline).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize exactly one JSON object.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {} by {:?}", self.sequence_id, self.kind, self.user)?;
        if !self.conversation.is_empty() {
            write!(f, " in {:?}", self.conversation)?;
        }
        Ok(())
    }
}

/// Wire and bootstrap errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    /// First tap of a session was not a usable auth tap
    #[error("First tap must be auth with valid user")]
    BadBootstrap,
    #[error("Connection closed")]
    ConnectionClosed,
}
