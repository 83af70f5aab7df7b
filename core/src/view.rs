/// Events published to the UI layer
use crate::connection::{ConnectionStatus, EndpointKey};
use crate::notify::Popup;
use crate::poller::PollTarget;
use crate::types::{Message, VisibleMessage};
use serde::{Deserialize, Serialize};

/// Everything the view needs to re-render, in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewEvent {
    /// A push endpoint changed status
    ConnectionChanged {
        endpoint: EndpointKey,
        status: ConnectionStatus,
    },
    /// The visible list of the active conversation changed
    MessagesChanged {
        conversation_id: String,
        messages: Vec<VisibleMessage>,
    },
    /// Conversation list refreshed or a conversation was marked read
    ConversationsChanged { total_unread: u64 },
    NotificationsChanged { unread_count: u64 },
    PopupShown { popup: Popup },
    /// Dropped before rendering; the user opened the conversation meanwhile
    PopupCancelled { popup_id: String },
    PopupRetracted { popup_id: String },
    Typing {
        conversation_id: String,
        user_id: String,
        display_name: String,
        is_typing: bool,
    },
    /// Direct send was rejected; put `restore_text` back into the input
    SendFailed {
        conversation_id: String,
        restore_text: String,
        error: String,
    },
    /// First load of a target failed; offer a retry
    InitialLoadFailed { target: PollTarget, error: String },
}

/// How a sent message left the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendReceipt {
    /// Written to the push channel; the server echo promotes it
    Pushed { temp_id: String },
    /// Stored through the request path; this is the server copy
    Stored { message: Message },
}
