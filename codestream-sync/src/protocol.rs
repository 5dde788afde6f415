//! JSON envelope protocol for session synchronization.
//!
//! Every frame on the wire is one UTF-8 JSON object:
//! ```text
//! ┌────────────┬──────────────┬───────────┬──────────────┬───────────────┐
//! │ type       │ session_id   │ user_id   │ user         │ data          │
//! │ string tag │ string       │ optional  │ user_join    │ per-type      │
//! └────────────┴──────────────┴───────────┴──────────────┴───────────────┘
//! ```
//!
//! `type` fully determines the shape of `data`. Decoding goes through a
//! loose [`RawEnvelope`] first so an unrecognized tag can be told apart
//! from a frame that is not an envelope at all. Callers see the closed
//! [`Message`] enum and never a half-parsed payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::presence::Participant;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A participant joined the session (relay-originated)
    UserJoin,
    /// A participant left the session (relay-originated)
    UserLeave,
    /// Full document text replacement
    CodeChange,
    /// Language mode replacement
    LanguageChange,
    /// Caret position of one participant
    CursorMove,
    /// Liveness check
    Ping,
    /// Liveness answer
    Pong,
}

impl MessageType {
    /// Wire tag for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::UserJoin => "user_join",
            MessageType::UserLeave => "user_leave",
            MessageType::CodeChange => "code_change",
            MessageType::LanguageChange => "language_change",
            MessageType::CursorMove => "cursor_move",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }

    /// Parses a wire tag. Unknown tags yield `None`.
    pub fn from_wire(tag: &str) -> Option<Self> {
        Some(match tag {
            "user_join" => MessageType::UserJoin,
            "user_leave" => MessageType::UserLeave,
            "code_change" => MessageType::CodeChange,
            "language_change" => MessageType::LanguageChange,
            "cursor_move" => MessageType::CursorMove,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Payloads
// ───────────────────────────────────────────────────────────────────

/// Payload of `code_change`. Always the full text, never a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChange {
    pub code: String,
    /// Milliseconds since the Unix epoch. The relay's state push omits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Payload of `language_change`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageChange {
    pub language: String,
}

/// Display descriptor riding along with a cursor update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorOwner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl From<&Participant> for CursorOwner {
    fn from(p: &Participant) -> Self {
        Self {
            id: Some(p.id.clone()),
            name: Some(p.name.clone()),
            color: Some(p.color.clone()),
        }
    }
}

/// Payload of `cursor_move`. Positions are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorMove {
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<CursorOwner>,
}

/// Decoded message body, one variant per wire tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    UserJoin(Participant),
    /// The departing participant is named by the envelope's `user_id`.
    UserLeave,
    CodeChange(CodeChange),
    LanguageChange(LanguageChange),
    CursorMove(CursorMove),
    Ping,
    Pong,
}

impl Message {
    /// Tag this message travels under.
    pub fn kind(&self) -> MessageType {
        match self {
            Message::UserJoin(_) => MessageType::UserJoin,
            Message::UserLeave => MessageType::UserLeave,
            Message::CodeChange(_) => MessageType::CodeChange,
            Message::LanguageChange(_) => MessageType::LanguageChange,
            Message::CursorMove(_) => MessageType::CursorMove,
            Message::Ping => MessageType::Ping,
            Message::Pong => MessageType::Pong,
        }
    }

    /// Returns true for keepalive traffic that must never be queued.
    pub fn is_transient(&self) -> bool {
        matches!(self, Message::Ping | Message::Pong)
    }
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// Loose wire shape. Every field but `type` is optional here.
#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub session_id: String,
    /// Originating participant. An empty string on the wire decodes as `None`.
    pub user_id: Option<String>,
    pub message: Message,
}

impl Envelope {
    pub fn new(session_id: impl Into<String>, user_id: Option<String>, message: Message) -> Self {
        Self {
            session_id: session_id.into(),
            user_id,
            message,
        }
    }

    /// Create a full-text replacement message.
    pub fn code_change(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        code: impl Into<String>,
        timestamp: Option<i64>,
    ) -> Self {
        Self::new(
            session_id,
            Some(user_id.into()),
            Message::CodeChange(CodeChange {
                code: code.into(),
                timestamp,
            }),
        )
    }

    /// Create a language replacement message.
    pub fn language_change(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            Some(user_id.into()),
            Message::LanguageChange(LanguageChange {
                language: language.into(),
            }),
        )
    }

    /// Create a cursor update carrying the sender's display descriptor.
    pub fn cursor_move(session_id: impl Into<String>, owner: &Participant, line: u32, column: u32) -> Self {
        Self::new(
            session_id,
            Some(owner.id.clone()),
            Message::CursorMove(CursorMove {
                line,
                column,
                user: Some(CursorOwner::from(owner)),
            }),
        )
    }

    /// Create a join announcement.
    pub fn user_join(session_id: impl Into<String>, participant: Participant) -> Self {
        Self::new(session_id, None, Message::UserJoin(participant))
    }

    /// Create a leave announcement.
    pub fn user_leave(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(session_id, Some(user_id.into()), Message::UserLeave)
    }

    /// Create a ping message.
    pub fn ping(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(session_id, Some(user_id.into()), Message::Ping)
    }

    /// Create a pong message.
    pub fn pong(session_id: impl Into<String>) -> Self {
        Self::new(session_id, None, Message::Pong)
    }

    pub fn kind(&self) -> MessageType {
        self.message.kind()
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let (user, data) = match &self.message {
            Message::UserJoin(participant) => (Some(participant.clone()), None),
            Message::CodeChange(payload) => (None, Some(serde_json::to_value(payload)?)),
            Message::LanguageChange(payload) => (None, Some(serde_json::to_value(payload)?)),
            Message::CursorMove(payload) => (None, Some(serde_json::to_value(payload)?)),
            Message::UserLeave | Message::Ping | Message::Pong => (None, None),
        };
        let raw = RawEnvelope {
            kind: self.kind().as_str().to_owned(),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            user,
            data,
        };
        Ok(serde_json::to_string(&raw)?)
    }

    /// Deserialize from a JSON text holding exactly one envelope.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Deserialize every envelope in one text frame.
    ///
    /// The relay coalesces queued messages into a single frame separated by
    /// newlines. Each envelope decodes independently; a frame that stops
    /// being JSON ends the batch with one `Malformed` entry.
    pub fn decode_frame(text: &str) -> Vec<Result<Self, ProtocolError>> {
        let mut decoded = Vec::new();
        for raw in serde_json::Deserializer::from_str(text).into_iter::<RawEnvelope>() {
            match raw {
                Ok(raw) => decoded.push(Self::from_raw(raw)),
                Err(e) => {
                    decoded.push(Err(e.into()));
                    break;
                }
            }
        }
        decoded
    }

    fn from_raw(raw: RawEnvelope) -> Result<Self, ProtocolError> {
        let kind = MessageType::from_wire(&raw.kind)
            .ok_or_else(|| ProtocolError::UnknownType(raw.kind.clone()))?;

        let message = match kind {
            MessageType::UserJoin => {
                Message::UserJoin(raw.user.ok_or(ProtocolError::MissingField("user"))?)
            }
            MessageType::UserLeave => Message::UserLeave,
            MessageType::CodeChange => Message::CodeChange(payload(raw.data)?),
            MessageType::LanguageChange => Message::LanguageChange(payload(raw.data)?),
            MessageType::CursorMove => Message::CursorMove(payload(raw.data)?),
            MessageType::Ping => Message::Ping,
            MessageType::Pong => Message::Pong,
        };

        Ok(Self {
            session_id: raw.session_id,
            user_id: raw.user_id.filter(|id| !id.is_empty()),
            message,
        })
    }
}

fn payload<T: DeserializeOwned>(data: Option<Value>) -> Result<T, ProtocolError> {
    let data = data.ok_or(ProtocolError::MissingField("data"))?;
    Ok(serde_json::from_value(data)?)
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not JSON, or a payload of the wrong shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Well-formed envelope with a tag this client does not speak.
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    /// The tag requires a field the frame does not carry.
    #[error("missing `{0}` for this message type")]
    MissingField(&'static str),
}
