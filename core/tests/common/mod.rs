#![allow(dead_code)]
//! In-memory fakes shared by the integration tests

use async_trait::async_trait;
use chatsync_core::api::ChatApi;
use chatsync_core::clock::{Clock, SharedClock};
use chatsync_core::connection::{EndpointKey, InboundFrame, PushSocket, PushTransport};
use chatsync_core::types::{Conversation, CurrentUser, Message, NotificationEvent, NotificationFeed};
use chatsync_core::{Result, SyncError, ViewEvent};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

// ─── Push transport ──────────────────────────────────────────────────────────

/// The server side of one fake socket
pub struct ServerEnd {
    pub endpoint: EndpointKey,
    pub token: String,
    to_client: mpsc::UnboundedSender<Result<InboundFrame>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn push(&self, frame: serde_json::Value) {
        let _ = self.to_client.send(Ok(InboundFrame::Text(frame.to_string())));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.to_client.send(Ok(InboundFrame::Text(text.to_string())));
    }

    pub fn close(&self, code: Option<u16>) {
        let _ = self.to_client.send(Ok(InboundFrame::Close(code)));
    }

    /// Next text the client wrote, parsed
    pub async fn next_sent(&mut self) -> serde_json::Value {
        let text = timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client socket gone");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }
}

struct FakeSocket {
    inbound: mpsc::UnboundedReceiver<Result<InboundFrame>>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl PushSocket for FakeSocket {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| SyncError::WebSocket("server end dropped".to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransport {
    refuse: AtomicBool,
    attempts: AtomicUsize,
    ends: Mutex<HashMap<EndpointKey, VecDeque<ServerEnd>>>,
    arrived: Notify,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every handshake fail
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next accepted socket on `endpoint`
    pub async fn accept(&self, endpoint: &EndpointKey) -> ServerEnd {
        let wait = async {
            loop {
                let arrived = self.arrived.notified();
                let end = self
                    .ends
                    .lock()
                    .unwrap()
                    .get_mut(endpoint)
                    .and_then(|queue| queue.pop_front());
                if let Some(end) = end {
                    return end;
                }
                arrived.await;
            }
        };
        timeout(WAIT, wait)
            .await
            .unwrap_or_else(|_| panic!("no connection to {}", endpoint))
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn connect(&self, endpoint: &EndpointKey, token: &str) -> Result<Box<dyn PushSocket>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::WebSocket("connection refused".to_string()));
        }
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let end = ServerEnd {
            endpoint: endpoint.clone(),
            token: token.to_string(),
            to_client,
            from_client,
        };
        self.ends
            .lock()
            .unwrap()
            .entry(endpoint.clone())
            .or_default()
            .push_back(end);
        self.arrived.notify_waiters();
        Ok(Box::new(FakeSocket { inbound, outbound }))
    }
}

// ─── Chat API ────────────────────────────────────────────────────────────────

pub struct FakeApi {
    clock: SharedClock,
    pub user: CurrentUser,
    pub conversations: Mutex<Vec<Conversation>>,
    pub messages: Mutex<HashMap<String, Vec<Message>>>,
    pub feed: Mutex<NotificationFeed>,
    pub fail_posts: AtomicBool,
    pub fail_lists: AtomicBool,
    pub calls: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl FakeApi {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            user: user("u1", "Ana"),
            conversations: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            feed: Mutex::new(NotificationFeed::default()),
            fail_posts: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_lists(&self) -> Result<()> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(SyncError::Http {
                status: 503,
                message: "maintenance".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn current_user(&self) -> Result<CurrentUser> {
        self.record("me".to_string());
        Ok(self.user.clone())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.record("conversations".to_string());
        self.check_lists()?;
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.record(format!("messages {}", conversation_id));
        self.check_lists()?;
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn post_message(&self, conversation_id: &str, body: &str) -> Result<Message> {
        self.record(format!("post {}", conversation_id));
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(SyncError::Http {
                status: 403,
                message: "not a participant".to_string(),
            });
        }
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let stored = Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: self.user.id.clone(),
            sender_display_name: self.user.display_name.clone(),
            body: body.to_string(),
            created_at: self.clock.now(),
        };
        self.messages
            .lock()
            .unwrap()
            .entry(conversation_id.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()> {
        self.record(format!("read {}", conversation_id));
        Ok(())
    }

    async fn list_notifications(&self, _limit: usize) -> Result<NotificationFeed> {
        self.record("notifications".to_string());
        self.check_lists()?;
        Ok(self.feed.lock().unwrap().clone())
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        self.record(format!("notification read {}", notification_id));
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> Result<()> {
        self.record("notifications read-all".to_string());
        Ok(())
    }
}

// ─── Builders & helpers ──────────────────────────────────────────────────────

pub fn user(id: &str, name: &str) -> CurrentUser {
    CurrentUser {
        id: id.to_string(),
        display_name: name.to_string(),
    }
}

pub fn message(id: &str, conversation: &str, sender: &str, body: &str, at: DateTime<Utc>) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation.to_string(),
        sender_id: sender.to_string(),
        sender_display_name: format!("user {}", sender),
        body: body.to_string(),
        created_at: at,
    }
}

pub fn conversation(id: &str, unread: u64, at: DateTime<Utc>) -> Conversation {
    Conversation {
        id: id.to_string(),
        participant_summary: format!("thread {}", id),
        last_message: None,
        unread_count: unread,
        updated_at: at,
    }
}

pub fn reminder(id: &str, at: DateTime<Utc>) -> NotificationEvent {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "kind": {"type": "scheduling_reminder", "title": "Call Bob"},
        "created_at": at,
    }))
    .unwrap()
}

/// Wait for the first view event matching `pred`
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<ViewEvent>, mut pred: F) -> ViewEvent
where
    F: FnMut(&ViewEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("view events closed"),
            }
        }
    };
    timeout(WAIT, wait).await.expect("timed out waiting for view event")
}
