/// Unread accounting and notification routing
///
/// Single source of truth for unread counts, and the only place that decides
/// whether an incoming event becomes a popup.
use crate::clock::{to_delta, SharedClock};
use crate::context::ActiveContextReader;
use crate::types::{Conversation, Message, NotificationEvent, NotificationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::debug;

/// Popup timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopupTimings {
    /// Wait before rendering, then re-check the active context
    pub suppression_delay: Duration,
    pub message_timeout: Duration,
    pub reminder_timeout: Duration,
}

impl Default for PopupTimings {
    fn default() -> Self {
        Self {
            suppression_delay: Duration::from_millis(500),
            message_timeout: Duration::from_secs(5),
            reminder_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopupKind {
    Message,
    SchedulingReminder,
    EntityChange,
}

/// A transient popup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Popup {
    pub id: String,
    pub kind: PopupKind,
    pub notification_id: Option<String>,
    pub conversation_id: Option<String>,
    pub title: String,
    pub body: String,
    /// Set when rendered
    pub shown_at: Option<DateTime<Utc>>,
}

/// Outcome of routing one message arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// User is looking at the conversation; merged silently
    Suppressed,
    /// Popup scheduled; rendered after the suppression delay if still relevant
    Scheduled(String),
    /// Already routed through another channel
    Duplicate,
}

/// Outcome of one pushed notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    Duplicate,
    Stored { popup: Option<String> },
}

/// Changes produced by `poll_due`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopupChange {
    Shown(Popup),
    /// Dropped before rendering because the user is now viewing the conversation
    Cancelled(String),
    Retracted(String),
}

/// Bounded FIFO set of recently seen ids
#[derive(Debug, Clone)]
pub struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Remember `id`. False if it was already known.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }
}

struct ScheduledPopup {
    popup: Popup,
    due_at: DateTime<Utc>,
}

struct ShownPopup {
    popup: Popup,
    expires_at: DateTime<Utc>,
}

pub struct NotificationRouter {
    clock: SharedClock,
    context: ActiveContextReader,
    timings: PopupTimings,
    feed_limit: usize,
    conversations: Vec<Conversation>,
    total_unread: u64,
    notifications: Vec<NotificationEvent>,
    notification_unread: u64,
    recent: RecentIds,
    /// Message ids that already went through popup routing
    recent_messages: RecentIds,
    feed_seeded: bool,
    scheduled: Vec<ScheduledPopup>,
    shown: Vec<ShownPopup>,
    popup_seq: u64,
}

impl NotificationRouter {
    pub fn new(
        clock: SharedClock,
        context: ActiveContextReader,
        timings: PopupTimings,
        recent_capacity: usize,
        feed_limit: usize,
    ) -> Self {
        Self {
            clock,
            context,
            timings,
            feed_limit: feed_limit.max(1),
            conversations: Vec::new(),
            total_unread: 0,
            notifications: Vec::new(),
            notification_unread: 0,
            recent: RecentIds::new(recent_capacity),
            recent_messages: RecentIds::new(recent_capacity),
            feed_seeded: false,
            scheduled: Vec::new(),
            shown: Vec::new(),
            popup_seq: 0,
        }
    }

    // ─── Conversations & unread ───────────────────────────────────────────────

    /// Replace the conversation list wholesale and recompute the total
    pub fn refresh_conversations(&mut self, mut list: Vec<Conversation>) -> u64 {
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        self.total_unread = list.iter().map(|c| c.unread_count).sum();
        self.conversations = list;
        self.total_unread
    }

    /// Explicit read acknowledgment. Returns the unread count it cleared.
    pub fn mark_conversation_read(&mut self, conversation_id: &str) -> Option<u64> {
        let conversation = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)?;
        let prior = conversation.unread_count;
        conversation.unread_count = 0;
        self.total_unread = self.total_unread.saturating_sub(prior);
        Some(prior)
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn total_unread_count(&self) -> u64 {
        self.total_unread
    }

    /// Keep the list preview current between refreshes. Counts are left alone.
    pub fn note_last_message(&mut self, message: &Message) {
        if let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        {
            let newer = conversation
                .last_message
                .as_ref()
                .map_or(true, |last| message.cmp_order(last).is_gt());
            if newer {
                conversation.last_message = Some(message.clone());
                conversation.updated_at = conversation.updated_at.max(message.created_at);
            }
        }
    }

    // ─── Message arrivals ─────────────────────────────────────────────────────

    /// Decide whether a chat message should pop up
    pub fn route_message_arrival(&mut self, message: &Message) -> ArrivalOutcome {
        self.note_last_message(message);
        if !self.recent_messages.insert(&message.id) {
            return ArrivalOutcome::Duplicate;
        }
        if self.context.is_viewing(&message.conversation_id) {
            debug!(
                "Suppressing popup for {} (conversation {} on screen)",
                message.id, message.conversation_id
            );
            return ArrivalOutcome::Suppressed;
        }
        let popup = self.new_popup(
            PopupKind::Message,
            None,
            Some(message.conversation_id.clone()),
            message.sender_display_name.clone(),
            message.body.clone(),
        );
        ArrivalOutcome::Scheduled(self.schedule(popup))
    }

    // ─── Notification feed ────────────────────────────────────────────────────

    /// A notification delivered over the push channel
    pub fn on_notification(
        &mut self,
        event: NotificationEvent,
        unread_hint: Option<u64>,
    ) -> NotificationOutcome {
        if !self.recent.insert(&event.id) {
            debug!("Dropping duplicate notification {}", event.id);
            return NotificationOutcome::Duplicate;
        }
        if self.notifications.iter().any(|n| n.id == event.id) {
            // Known from the feed but evicted from the recent set
            return NotificationOutcome::Duplicate;
        }

        match unread_hint {
            Some(count) => self.notification_unread = count,
            None if !event.is_read => self.notification_unread += 1,
            None => {}
        }
        let popup = if event.is_read {
            None
        } else {
            self.popup_for(&event)
        };
        self.insert_notification(event);
        NotificationOutcome::Stored { popup }
    }

    /// Authoritative feed from a fetch. It replaces the list, so entries gone
    /// on the server disappear here too. Every id is still remembered as seen.
    /// The first fetch seeds the list without popups; later ones pop up unseen
    /// unread items.
    pub fn merge_notifications(&mut self, mut feed: Vec<NotificationEvent>, unread_count: u64) -> Vec<String> {
        let seeding = !self.feed_seeded;
        self.feed_seeded = true;
        let mut popups = Vec::new();

        let mut ids = HashSet::new();
        feed.retain(|event| ids.insert(event.id.clone()));
        for event in &feed {
            let unseen = self.recent.insert(&event.id)
                && !self.notifications.iter().any(|n| n.id == event.id);
            if unseen && !seeding && !event.is_read {
                if let Some(popup) = self.popup_for(event) {
                    popups.push(popup);
                }
            }
        }
        self.notifications = feed;
        self.order_notifications();
        self.notification_unread = unread_count;
        popups
    }

    pub fn mark_notification_read(&mut self, id: &str) -> bool {
        match self.notifications.iter_mut().find(|n| n.id == id) {
            Some(n) if !n.is_read => {
                n.is_read = true;
                self.notification_unread = self.notification_unread.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    pub fn mark_all_notifications_read(&mut self) {
        for n in &mut self.notifications {
            n.is_read = true;
        }
        self.notification_unread = 0;
    }

    /// Unread count correction from the server
    pub fn apply_unread_correction(&mut self, unread_count: u64) {
        self.notification_unread = unread_count;
    }

    pub fn notifications(&self) -> &[NotificationEvent] {
        &self.notifications
    }

    pub fn notification_unread_count(&self) -> u64 {
        self.notification_unread
    }

    fn insert_notification(&mut self, event: NotificationEvent) {
        self.notifications.push(event);
        self.order_notifications();
    }

    /// Newest first, capped at the feed limit
    fn order_notifications(&mut self) {
        self.notifications
            .sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        self.notifications.truncate(self.feed_limit);
    }

    fn popup_for(&mut self, event: &NotificationEvent) -> Option<String> {
        let popup = match &event.kind {
            NotificationKind::MessageArrival {
                conversation_id,
                message_id,
                sender_display_name,
                preview,
            } => {
                if let Some(message_id) = message_id {
                    if !self.recent_messages.insert(message_id) {
                        debug!("Message {} already routed, no second popup", message_id);
                        return None;
                    }
                }
                if self.context.is_viewing(conversation_id) {
                    debug!("Suppressing notification popup {} (on screen)", event.id);
                    return None;
                }
                self.new_popup(
                    PopupKind::Message,
                    Some(event.id.clone()),
                    Some(conversation_id.clone()),
                    sender_display_name.clone(),
                    preview.clone(),
                )
            }
            NotificationKind::SchedulingReminder { title, starts_at } => self.new_popup(
                PopupKind::SchedulingReminder,
                Some(event.id.clone()),
                None,
                title.clone(),
                starts_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
            NotificationKind::EntityChange {
                entity,
                entity_id,
                action,
            } => self.new_popup(
                PopupKind::EntityChange,
                Some(event.id.clone()),
                None,
                format!("{} {}", entity, action),
                entity_id.clone(),
            ),
        };
        Some(self.schedule(popup))
    }

    // ─── Popup scheduling ─────────────────────────────────────────────────────

    fn new_popup(
        &mut self,
        kind: PopupKind,
        notification_id: Option<String>,
        conversation_id: Option<String>,
        title: String,
        body: String,
    ) -> Popup {
        self.popup_seq += 1;
        Popup {
            id: format!("popup-{}", self.popup_seq),
            kind,
            notification_id,
            conversation_id,
            title,
            body,
            shown_at: None,
        }
    }

    fn schedule(&mut self, popup: Popup) -> String {
        let id = popup.id.clone();
        let due_at = self.clock.now() + to_delta(self.timings.suppression_delay);
        self.scheduled.push(ScheduledPopup { popup, due_at });
        id
    }

    fn timeout_for(&self, kind: PopupKind) -> Duration {
        match kind {
            PopupKind::SchedulingReminder => self.timings.reminder_timeout,
            PopupKind::Message | PopupKind::EntityChange => self.timings.message_timeout,
        }
    }

    /// Render due popups (re-checking the *current* context) and retract
    /// expired ones
    pub fn poll_due(&mut self) -> Vec<PopupChange> {
        let now = self.clock.now();
        let mut changes = Vec::new();

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|s| s.due_at <= now);
        self.scheduled = waiting;

        for ScheduledPopup { mut popup, .. } in due {
            let now_viewing = popup.kind == PopupKind::Message
                && popup
                    .conversation_id
                    .as_deref()
                    .is_some_and(|c| self.context.is_viewing(c));
            if now_viewing {
                debug!("Cancelling popup {}, conversation now on screen", popup.id);
                changes.push(PopupChange::Cancelled(popup.id));
                continue;
            }
            popup.shown_at = Some(now);
            let expires_at = now + to_delta(self.timeout_for(popup.kind));
            changes.push(PopupChange::Shown(popup.clone()));
            self.shown.push(ShownPopup { popup, expires_at });
        }

        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.shown)
            .into_iter()
            .partition(|s| s.expires_at <= now);
        self.shown = live;
        changes.extend(expired.into_iter().map(|s| PopupChange::Retracted(s.popup.id)));

        changes
    }

    /// User closed a popup early
    pub fn dismiss(&mut self, popup_id: &str) -> bool {
        let before = self.shown.len() + self.scheduled.len();
        self.shown.retain(|s| s.popup.id != popup_id);
        self.scheduled.retain(|s| s.popup.id != popup_id);
        before != self.shown.len() + self.scheduled.len()
    }

    pub fn visible_popups(&self) -> Vec<Popup> {
        self.shown.iter().map(|s| s.popup.clone()).collect()
    }

    /// Earliest moment something changes
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.scheduled
            .iter()
            .map(|s| s.due_at)
            .chain(self.shown.iter().map(|s| s.expires_at))
            .min()
    }
}
