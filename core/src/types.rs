/// Shared types for the sync layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Prefix of locally generated message ids
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// A chat message. Immutable once it carries a server id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_display_name: String,
    #[serde(alias = "content")]
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Visible ordering: `created_at`, tie-broken by id
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }

    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// Optimistic local message awaiting its server copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub message: Message,
}

impl PendingMessage {
    pub fn new(
        conversation_id: &str,
        sender: &CurrentUser,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message: Message {
                id: format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4()),
                conversation_id: conversation_id.to_string(),
                sender_id: sender.id.clone(),
                sender_display_name: sender.display_name.clone(),
                body: body.to_string(),
                created_at,
            },
        }
    }

    pub fn temp_id(&self) -> &str {
        &self.message.id
    }

    /// Same conversation, sender and body, created within `window` of each other
    pub fn matches(&self, server: &Message, window: chrono::Duration) -> bool {
        let m = &self.message;
        let delta = server.created_at - m.created_at;
        m.conversation_id == server.conversation_id
            && m.sender_id == server.sender_id
            && m.body == server.body
            && delta <= window
            && delta >= -window
    }
}

/// Delivery state of a message in the visible list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Pending,
    Confirmed,
}

/// One row of the visible message list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleMessage {
    #[serde(flatten)]
    pub message: Message,
    pub delivery: Delivery,
}

/// Summary of one conversation thread (for the list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub participant_summary: String,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// The signed-in user, as the server knows them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

/// A notification feed entry. `kind` carries the discriminant and its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: String,
    pub kind: NotificationKind,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    /// A chat message arrived in some conversation
    MessageArrival {
        conversation_id: String,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        sender_display_name: String,
        #[serde(default)]
        preview: String,
    },
    /// Upcoming appointment / task reminder
    SchedulingReminder {
        title: String,
        #[serde(default)]
        starts_at: Option<DateTime<Utc>>,
    },
    /// A CRM record was created, changed or deleted
    EntityChange {
        entity: String,
        entity_id: String,
        action: String,
    },
}

impl NotificationKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NotificationKind::MessageArrival { .. } => "message_arrival",
            NotificationKind::SchedulingReminder { .. } => "scheduling_reminder",
            NotificationKind::EntityChange { .. } => "entity_change",
        }
    }
}

/// Notification page as returned by the REST feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFeed {
    #[serde(default)]
    pub results: Vec<NotificationEvent>,
    #[serde(default)]
    pub unread_count: u64,
}
