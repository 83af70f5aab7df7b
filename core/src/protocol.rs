/// Push channel frame definitions
use crate::error::{Result, SyncError};
use crate::types::{Message, NotificationEvent};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frames the server pushes to us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A message was stored in the room
    ChatMessage { message: Message },

    /// Someone in the room is (or stopped) typing
    Typing {
        user_id: String,
        #[serde(default)]
        display_name: String,
        #[serde(default = "default_true")]
        is_typing: bool,
    },

    /// Full notification record, with an optional unread count hint
    Notification {
        notification: NotificationEvent,
        #[serde(default)]
        unread_count: Option<u64>,
    },

    /// Something changed but the payload is too thin to build a record from
    EventNotification {
        #[serde(default)]
        event_id: Option<String>,
    },

    /// Server accepted the socket
    ConnectionEstablished {
        #[serde(default)]
        message: Option<String>,
    },

    /// A notification changed state elsewhere (read on another tab, etc.)
    NotificationUpdated {
        unread_count: u64,
        #[serde(default)]
        notification_id: Option<String>,
        #[serde(default)]
        is_read: Option<bool>,
    },

    /// Authoritative unread count
    UnreadCountUpdated { unread_count: u64 },
}

fn default_true() -> bool {
    true
}

impl PushEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PushEvent::ChatMessage { .. } => "chat_message",
            PushEvent::Typing { .. } => "typing",
            PushEvent::Notification { .. } => "notification",
            PushEvent::EventNotification { .. } => "event_notification",
            PushEvent::ConnectionEstablished { .. } => "connection_established",
            PushEvent::NotificationUpdated { .. } => "notification_updated",
            PushEvent::UnreadCountUpdated { .. } => "unread_count_updated",
        }
    }
}

impl fmt::Display for PushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PushEvent({})", self.event_type())
    }
}

/// Frames we send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    ChatMessage { content: String },
    MarkRead,
    Typing { is_typing: bool },
}

impl OutboundFrame {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse one inbound text frame.
///
/// Anything that is not a JSON object with a known `type` is an error; the
/// caller drops that frame and carries on.
pub fn parse_push_frame(text: &str) -> Result<PushEvent> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| SyncError::Protocol("frame has no type field".to_string()))?
        .to_string();
    serde_json::from_value(value)
        .map_err(|e| SyncError::Protocol(format!("bad {} frame: {}", kind, e)))
}
