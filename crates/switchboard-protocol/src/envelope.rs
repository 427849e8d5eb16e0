//! Message records exchanged between clients and gateway nodes.
//!
//! Two shapes exist. [`InboundPayload`] is what a browser sends; every field
//! is optional and the recipient is called `targetUserId`. [`Envelope`] is the
//! normalized record used everywhere after ingestion, where the recipient is
//! called `receiverId`. Envelopes carry no delivery identifier and are never
//! deduplicated.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of chat message.
///
/// The tag travels as a lowercase string in the `type` field. Tags this node
/// does not know are carried through unchanged in [`MessageKind::Other`] so a
/// relayed envelope is byte-for-byte what the sender produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Plain user text. Used when the client omits `type`.
    #[default]
    Text,
    /// Notice generated by a client or service rather than typed by a user.
    System,
    /// Any other tag.
    Other(String),
}

impl MessageKind {
    /// The wire tag for this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Text => "text",
            MessageKind::System => "system",
            MessageKind::Other(tag) => tag,
        }
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "text" => MessageKind::Text,
            "system" => MessageKind::System,
            _ => MessageKind::Other(tag),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(tag: &str) -> Self {
        MessageKind::from(tag.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> String {
        match kind {
            MessageKind::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chat message as sent by a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPayload {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub target_user_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<MessageKind>,
}

impl InboundPayload {
    /// Normalize into an [`Envelope`].
    ///
    /// `targetUserId` becomes `receiverId` and a missing `type` becomes
    /// [`MessageKind::Text`]. Nothing else is validated here.
    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        Envelope {
            content: self.content,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            receiver_id: self.target_user_id,
            timestamp: self.timestamp,
            kind: self.kind.unwrap_or_default(),
        }
    }
}

/// The normalized message record.
///
/// Created once at ingestion and never modified afterwards: the router and
/// relay bus forward it unchanged, and the recipient receives exactly this
/// structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
}

impl Envelope {
    /// Create a text envelope addressed to `receiver_id`.
    #[must_use]
    pub fn text(receiver_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            receiver_id: Some(receiver_id.into()),
            ..Self::default()
        }
    }

    /// Set the sender id and display name.
    #[must_use]
    pub fn from_sender(mut self, sender_id: impl Into<String>, sender_name: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self.sender_name = Some(sender_name.into());
        self
    }

    /// Set the message kind.
    #[must_use]
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// The recipient, if the sender named one.
    #[must_use]
    pub fn receiver(&self) -> Option<&str> {
        self.receiver_id.as_deref()
    }
}
