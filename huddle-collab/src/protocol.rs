//! JSON wire protocol shared by the client session and the relay.
//!
//! Every frame is a single text message:
//! ```text
//! {
//!   "id":          locally generated message id (uuid v4)
//!   "type":        message kind, snake_case
//!   "payload":     kind-specific body (absent for ping/pong)
//!   "document_id": document the message belongs to (optional)
//!   "sender_id":   user id of the sender
//!   "timestamp":   unix milliseconds at send time
//! }
//! ```
//!
//! The relay treats everything except `ping` and the `document_id` routing
//! key as opaque.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::comments::LiveComment;
use crate::conflict::ConflictResolution;
use crate::cursor::CursorUpdate;
use crate::edits::DocumentEdit;
use crate::error::ProtocolError;
use crate::presence::{PresenceLeft, PresenceUpdate};

/// Message kinds understood by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    UserPresenceUpdate,
    UserPresenceLeft,
    CursorPosition,
    CommentAdded,
    CommentUpdated,
    DocumentEdit,
    ConflictDetected,
    ConflictResolved,
    Ping,
    Pong,
    ConnectionEstablished,
}

impl MessageKind {
    pub const ALL: [MessageKind; 11] = [
        MessageKind::UserPresenceUpdate,
        MessageKind::UserPresenceLeft,
        MessageKind::CursorPosition,
        MessageKind::CommentAdded,
        MessageKind::CommentUpdated,
        MessageKind::DocumentEdit,
        MessageKind::ConflictDetected,
        MessageKind::ConflictResolved,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::ConnectionEstablished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::UserPresenceUpdate => "user_presence_update",
            MessageKind::UserPresenceLeft => "user_presence_left",
            MessageKind::CursorPosition => "cursor_position",
            MessageKind::CommentAdded => "comment_added",
            MessageKind::CommentUpdated => "comment_updated",
            MessageKind::DocumentEdit => "document_edit",
            MessageKind::ConflictDetected => "conflict_detected",
            MessageKind::ConflictResolved => "conflict_resolved",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::ConnectionEstablished => "connection_established",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake body sent by the endpoint right after the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub connection_id: String,
}

/// Message body, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    UserPresenceUpdate(PresenceUpdate),
    UserPresenceLeft(PresenceLeft),
    CursorPosition(CursorUpdate),
    CommentAdded(LiveComment),
    CommentUpdated(LiveComment),
    DocumentEdit(DocumentEdit),
    ConflictDetected(ConflictResolution),
    ConflictResolved(ConflictResolution),
    Ping,
    Pong,
    ConnectionEstablished(Handshake),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::UserPresenceUpdate(_) => MessageKind::UserPresenceUpdate,
            Message::UserPresenceLeft(_) => MessageKind::UserPresenceLeft,
            Message::CursorPosition(_) => MessageKind::CursorPosition,
            Message::CommentAdded(_) => MessageKind::CommentAdded,
            Message::CommentUpdated(_) => MessageKind::CommentUpdated,
            Message::DocumentEdit(_) => MessageKind::DocumentEdit,
            Message::ConflictDetected(_) => MessageKind::ConflictDetected,
            Message::ConflictResolved(_) => MessageKind::ConflictResolved,
            Message::Ping => MessageKind::Ping,
            Message::Pong => MessageKind::Pong,
            Message::ConnectionEstablished(_) => MessageKind::ConnectionEstablished,
        }
    }

    /// Heartbeat control frames. Never queued while offline.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Message::Ping | Message::Pong)
    }

    /// Critical messages survive queue overflow; presence and cursor updates
    /// are superseded by the next broadcast anyway.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            Message::UserPresenceUpdate(_) | Message::CursorPosition(_) | Message::Ping | Message::Pong
        )
    }
}

/// A framed message as it travels over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(flatten)]
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub sender_id: String,
    pub timestamp: u64,
}

impl Envelope {
    /// Wrap `message` with a fresh message id and the current time.
    pub fn new(message: Message, sender_id: impl Into<String>, document_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message,
            document_id,
            sender_id: sender_id.into(),
            timestamp: unix_millis(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Wall-clock unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fresh random identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
