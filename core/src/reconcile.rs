/// Message reconciliation for the active conversation
///
/// Three inputs feed one visible list: optimistic local sends, push-delivered
/// messages and poll-fetched batches. The list is a pure function of the set
/// of confirmed messages plus the pending set, ordered by `(created_at, id)`,
/// so the arrival order across paths never matters and `ingest` is idempotent.
///
/// A pending message is promoted by content, not by id: the first server
/// message with the same sender and body within the match window replaces it.
/// Each server message promotes at most one pending message, and only the
/// first time it is seen.
use crate::clock::{to_delta, SharedClock};
use crate::error::{Result, SyncError};
use crate::types::{CurrentUser, Delivery, Message, PendingMessage, VisibleMessage};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Identifies one authoritative fetch. Results for an outdated ticket are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub conversation_id: String,
    generation: u64,
}

pub struct ReconciliationEngine {
    clock: SharedClock,
    match_window: chrono::Duration,
    active: Option<String>,
    confirmed: HashMap<String, Message>,
    pending: HashMap<String, PendingMessage>,
    generation: u64,
}

impl ReconciliationEngine {
    pub fn new(clock: SharedClock, match_window: Duration) -> Self {
        Self {
            clock,
            match_window: to_delta(match_window),
            active: None,
            confirmed: HashMap::new(),
            pending: HashMap::new(),
            generation: 0,
        }
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Optimistically add a message typed by `sender`
    pub fn send_intent(
        &mut self,
        conversation_id: &str,
        body: &str,
        sender: &CurrentUser,
    ) -> Result<PendingMessage> {
        if self.active.as_deref() != Some(conversation_id) {
            return Err(SyncError::InactiveConversation(conversation_id.to_string()));
        }
        if body.trim().is_empty() {
            return Err(SyncError::InvalidIntent("message body is empty".to_string()));
        }
        let pending = PendingMessage::new(conversation_id, sender, body, self.clock.now());
        debug!(
            "Pending message {} in conversation {}",
            pending.temp_id(),
            conversation_id
        );
        self.pending
            .insert(pending.temp_id().to_string(), pending.clone());
        Ok(pending)
    }

    /// Merge an authoritative batch. Returns the new visible list, or `None`
    /// when the batch is for a conversation that is not active.
    pub fn ingest(&mut self, conversation_id: &str, batch: &[Message]) -> Option<Vec<VisibleMessage>> {
        if self.active.as_deref() != Some(conversation_id) {
            debug!(
                "Ignoring batch of {} for inactive conversation {}",
                batch.len(),
                conversation_id
            );
            return None;
        }

        let mut fresh: Vec<&Message> = Vec::new();
        for message in batch {
            if message.conversation_id != conversation_id || message.is_temporary() {
                continue;
            }
            if !self.confirmed.contains_key(&message.id) {
                self.confirmed.insert(message.id.clone(), message.clone());
                fresh.push(message);
            }
        }

        // Oldest pending first so repeated identical sends promote in order
        fresh.sort_by(|a, b| a.cmp_order(b));
        for server in fresh {
            let promoted = self
                .pending
                .values()
                .filter(|p| p.matches(server, self.match_window))
                .min_by(|a, b| a.message.cmp_order(&b.message))
                .map(|p| p.temp_id().to_string());
            if let Some(temp_id) = promoted {
                debug!("Promoted {} to {}", temp_id, server.id);
                self.pending.remove(&temp_id);
            }
        }

        Some(self.visible())
    }

    /// Ingest the result of a fetch, unless the conversation changed since
    pub fn accept_fetch(&mut self, ticket: &FetchTicket, batch: &[Message]) -> Option<Vec<VisibleMessage>> {
        if ticket.generation != self.generation {
            debug!(
                "Dropping stale fetch for conversation {}",
                ticket.conversation_id
            );
            return None;
        }
        self.ingest(&ticket.conversation_id, batch)
    }

    /// Ticket for a fetch of the active conversation
    pub fn fetch_ticket(&self) -> Option<FetchTicket> {
        self.active.as_ref().map(|id| FetchTicket {
            conversation_id: id.clone(),
            generation: self.generation,
        })
    }

    /// Direct send failed: drop the optimistic copy and hand back its text
    pub fn fail_pending(&mut self, temp_id: &str) -> Option<String> {
        self.pending.remove(temp_id).map(|p| p.message.body)
    }

    /// Switch to another conversation (or none). Pending messages of the old
    /// one are discarded and in-flight fetches for it become stale.
    pub fn switch_conversation(&mut self, conversation_id: Option<&str>) -> Option<FetchTicket> {
        if !self.pending.is_empty() {
            debug!(
                "Discarding {} pending messages on conversation switch",
                self.pending.len()
            );
        }
        self.pending.clear();
        self.confirmed.clear();
        self.active = conversation_id.map(str::to_string);
        self.generation += 1;
        self.fetch_ticket()
    }

    /// Current visible list, ordered by `(created_at, id)`
    pub fn visible(&self) -> Vec<VisibleMessage> {
        let mut list: Vec<VisibleMessage> = self
            .confirmed
            .values()
            .map(|m| VisibleMessage {
                message: m.clone(),
                delivery: Delivery::Confirmed,
            })
            .chain(self.pending.values().map(|p| VisibleMessage {
                message: p.message.clone(),
                delivery: Delivery::Pending,
            }))
            .collect();
        list.sort_by(|a, b| a.message.cmp_order(&b.message));
        list
    }
}
