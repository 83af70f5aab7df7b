/// Sync client: wires the connection controller, reconciliation engine,
/// notification router and poller together and publishes `ViewEvent`s
use crate::api::ChatApi;
use crate::cache::Repository;
use crate::clock::SharedClock;
use crate::config::Config;
use crate::connection::{
    ConnectionController, ConnectionEvent, ConnectionStatus, EndpointKey, PushTransport,
    ReconnectPolicy, SendOutcome,
};
use crate::context::{active_context, ActiveContext, ActiveContextReader, ActiveContextWriter};
use crate::credentials::CredentialSource;
use crate::error::{Result, SyncError};
use crate::notify::{
    ArrivalOutcome, NotificationOutcome, NotificationRouter, Popup, PopupChange, PopupTimings,
};
use crate::poller::{InFlight, PollSchedule, PollSink, PollTarget, PollingSynchronizer};
use crate::protocol::{OutboundFrame, PushEvent};
use crate::reconcile::{FetchTicket, ReconciliationEngine};
use crate::types::{Conversation, CurrentUser, Message, NotificationEvent, NotificationKind, VisibleMessage};
use crate::view::{SendReceipt, ViewEvent};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const VIEW_EVENT_CAPACITY: usize = 256;

pub struct SyncClient {
    config: Config,
    api: Arc<dyn ChatApi>,
    credentials: Arc<dyn CredentialSource>,
    controller: ConnectionController,
    /// Taken by `start`
    connection_events: Arc<Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>>,
    /// Sole writer of the active context; the lock also serializes navigation
    navigation: Arc<Mutex<ActiveContextWriter>>,
    context: ActiveContextReader,
    engine: Arc<RwLock<ReconciliationEngine>>,
    router: Arc<RwLock<NotificationRouter>>,
    current_user: Arc<Repository<CurrentUser>>,
    in_flight: InFlight,
    poller: Arc<Mutex<Option<PollingSynchronizer>>>,
    /// Initial loads that failed and can be retried
    failed_initial: Arc<Mutex<HashSet<PollTarget>>>,
    events: broadcast::Sender<ViewEvent>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncClient {
    pub fn new(
        config: Config,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn PushTransport>,
        credentials: Arc<dyn CredentialSource>,
        clock: SharedClock,
    ) -> Self {
        let policy = ReconnectPolicy {
            delay: config.reconnect_delay,
            max_consecutive_failures: config.max_consecutive_failures,
        };
        let (controller, connection_events) =
            ConnectionController::new(transport, credentials.clone(), policy);
        let (writer, reader) = active_context();

        let timings = PopupTimings {
            suppression_delay: config.popup_suppression_delay,
            message_timeout: config.message_popup_timeout,
            reminder_timeout: config.reminder_popup_timeout,
        };
        let engine = ReconciliationEngine::new(clock.clone(), config.pending_match_window);
        let router = NotificationRouter::new(
            clock.clone(),
            reader.clone(),
            timings,
            config.recent_notification_capacity,
            config.notification_feed_limit,
        );
        let current_user = Repository::new("current_user", clock, config.current_user_ttl);
        let (events, _) = broadcast::channel(VIEW_EVENT_CAPACITY);

        Self {
            config,
            api,
            credentials,
            controller,
            connection_events: Arc::new(Mutex::new(Some(connection_events))),
            navigation: Arc::new(Mutex::new(writer)),
            context: reader,
            engine: Arc::new(RwLock::new(engine)),
            router: Arc::new(RwLock::new(router)),
            current_user: Arc::new(current_user),
            in_flight: InFlight::new(),
            poller: Arc::new(Mutex::new(None)),
            failed_initial: Arc::new(Mutex::new(HashSet::new())),
            events,
            tasks: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Connect, run the initial load and start polling. Load failures are
    /// reported as `ViewEvent::InitialLoadFailed`, not as an error here.
    pub async fn start(&self) -> Result<()> {
        let Some(mut connection_events) = self.connection_events.lock().await.take() else {
            return Err(SyncError::Config("sync client already started".to_string()));
        };
        info!("Starting sync client against {}", self.config.base_url);

        let pump = {
            let client = self.clone();
            tokio::spawn(async move {
                while let Some(event) = connection_events.recv().await {
                    client.handle_connection_event(event).await;
                }
            })
        };
        let ticker = {
            let client = self.clone();
            tokio::spawn(async move { client.run_popup_ticker().await })
        };
        self.tasks.lock().await.extend([pump, ticker]);

        if let Err(e) = self.current_user().await {
            warn!("Could not load current user: {}", e);
        }
        self.ensure_connected().await;
        self.initial_load(PollTarget::Conversations).await;
        self.initial_load(PollTarget::Notifications).await;

        let schedule = PollSchedule {
            conversations: self.config.conversation_poll_interval,
            notifications: self.config.notification_poll_interval,
        };
        let sink: Arc<dyn PollSink> = Arc::new(self.clone());
        let poller = PollingSynchronizer::start(sink, self.in_flight.clone(), schedule);
        *self.poller.lock().await = Some(poller);

        if let Some(id) = self.config.initial_conversation.clone() {
            self.navigate(ActiveContext::viewing(id)).await;
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    pub fn context(&self) -> ActiveContextReader {
        self.context.clone()
    }

    /// (Re)open the push endpoints we want. Call again once credentials
    /// become available; a no-op for endpoints already open or disabled.
    pub async fn ensure_connected(&self) {
        if !self.config.enable_push {
            return;
        }
        let token = self.credentials.bearer();
        self.controller
            .connect(&EndpointKey::notifications(), token.as_deref())
            .await;
        if let Some(id) = self.context.current().active_conversation_id {
            self.controller
                .connect(&EndpointKey::room(&id), token.as_deref())
                .await;
        }
    }

    /// New login session: forget disabled endpoints and the cached profile
    pub async fn reset_session(&self) {
        self.controller.reset_session().await;
        self.current_user.invalidate().await;
        self.ensure_connected().await;
    }

    pub async fn current_user(&self) -> Result<CurrentUser> {
        let api = self.api.clone();
        self.current_user
            .get_or_fetch(|| async move { api.current_user().await })
            .await
    }

    // ─── Navigation ───────────────────────────────────────────────────────────

    /// Apply one navigation transition: switch the active conversation,
    /// move the room subscription, load its messages and mark it read.
    pub async fn navigate(&self, next: ActiveContext) {
        let writer = self.navigation.lock().await;
        let previous = writer.navigate(next.clone());
        if previous == next {
            return;
        }

        let old_id = previous.active_conversation_id;
        let new_id = next.active_conversation_id.clone();
        let switched = old_id != new_id;
        if switched {
            let messages = {
                let mut engine = self.engine.write().await;
                engine.switch_conversation(new_id.as_deref());
                engine.visible()
            };
            if let Some(old) = &old_id {
                self.controller.disconnect(&EndpointKey::room(old)).await;
            }
            if let Some(new) = &new_id {
                info!("Opened conversation {}", new);
                self.emit(ViewEvent::MessagesChanged {
                    conversation_id: new.clone(),
                    messages,
                });
                if self.config.enable_push {
                    let token = self.credentials.bearer();
                    self.controller
                        .connect(&EndpointKey::room(new), token.as_deref())
                        .await;
                }
            }
        }
        drop(writer);

        if switched && new_id.is_some() {
            self.initial_load(PollTarget::ActiveMessages).await;
        }
        if next.is_on_conversation_screen {
            if let Some(id) = new_id.as_deref() {
                if let Err(e) = self.mark_conversation_read(id).await {
                    warn!("Failed to mark conversation {} read: {}", id, e);
                }
            }
        }
    }

    // ─── Intents ──────────────────────────────────────────────────────────────

    /// Optimistically add a message, then deliver it over the room channel or,
    /// if that is unavailable, through a direct request. A rejected direct
    /// request reverts the optimistic copy and emits `SendFailed`.
    pub async fn send_message(&self, conversation_id: &str, body: &str) -> Result<SendReceipt> {
        let me = self.current_user().await?;
        let (pending, messages) = {
            let mut engine = self.engine.write().await;
            let pending = engine.send_intent(conversation_id, body, &me)?;
            (pending, engine.visible())
        };
        self.emit(ViewEvent::MessagesChanged {
            conversation_id: conversation_id.to_string(),
            messages,
        });

        let frame = OutboundFrame::ChatMessage {
            content: body.to_string(),
        };
        if self.send_frame(conversation_id, &frame).await? == SendOutcome::Sent {
            debug!("Sent {} over push channel", pending.temp_id());
            return Ok(SendReceipt::Pushed {
                temp_id: pending.temp_id().to_string(),
            });
        }

        match self.api.post_message(conversation_id, body).await {
            Ok(message) => {
                self.apply_batch(conversation_id, std::slice::from_ref(&message), None)
                    .await;
                self.router.write().await.note_last_message(&message);
                Ok(SendReceipt::Stored { message })
            }
            Err(e) => {
                warn!("Sending to {} failed: {}", conversation_id, e);
                let (restored, messages) = {
                    let mut engine = self.engine.write().await;
                    (engine.fail_pending(pending.temp_id()), engine.visible())
                };
                if restored.is_some() {
                    self.emit(ViewEvent::MessagesChanged {
                        conversation_id: conversation_id.to_string(),
                        messages,
                    });
                }
                self.emit(ViewEvent::SendFailed {
                    conversation_id: conversation_id.to_string(),
                    restore_text: restored.unwrap_or_else(|| body.to_string()),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Acknowledge everything in a conversation as read
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()> {
        let cleared = {
            let mut router = self.router.write().await;
            router
                .mark_conversation_read(conversation_id)
                .map(|_| router.total_unread_count())
        };
        if let Some(total_unread) = cleared {
            self.emit(ViewEvent::ConversationsChanged { total_unread });
        }

        if self.send_frame(conversation_id, &OutboundFrame::MarkRead).await? == SendOutcome::Unavailable {
            self.api.mark_conversation_read(conversation_id).await?;
        }
        Ok(())
    }

    /// Typing indicator. Push only; dropped when the channel is down.
    pub async fn set_typing(&self, conversation_id: &str, is_typing: bool) -> Result<SendOutcome> {
        self.send_frame(conversation_id, &OutboundFrame::Typing { is_typing })
            .await
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        let changed = {
            let mut router = self.router.write().await;
            router
                .mark_notification_read(notification_id)
                .then(|| router.notification_unread_count())
        };
        if let Some(unread_count) = changed {
            self.emit(ViewEvent::NotificationsChanged { unread_count });
        }
        self.api.mark_notification_read(notification_id).await
    }

    pub async fn mark_all_notifications_read(&self) -> Result<()> {
        self.router.write().await.mark_all_notifications_read();
        self.emit(ViewEvent::NotificationsChanged { unread_count: 0 });
        self.api.mark_all_notifications_read().await
    }

    /// Close a popup before it times out
    pub async fn dismiss_popup(&self, popup_id: &str) -> bool {
        let dismissed = self.router.write().await.dismiss(popup_id);
        if dismissed {
            self.emit(ViewEvent::PopupRetracted {
                popup_id: popup_id.to_string(),
            });
        }
        dismissed
    }

    /// Re-run initial loads that failed
    pub async fn retry_initial_load(&self) {
        let targets: Vec<PollTarget> = self.failed_initial.lock().await.drain().collect();
        for target in targets {
            info!("Retrying initial load of {}", target);
            self.initial_load(target).await;
        }
    }

    /// Stop polling and close every endpoint cleanly
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop().await;
        }
        self.controller.shutdown().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("Sync client stopped");
    }

    // ─── Snapshots ────────────────────────────────────────────────────────────

    pub async fn active_conversation(&self) -> Option<String> {
        self.engine
            .read()
            .await
            .active_conversation()
            .map(str::to_string)
    }

    pub async fn visible_messages(&self) -> Vec<VisibleMessage> {
        self.engine.read().await.visible()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.router.read().await.conversations().to_vec()
    }

    pub async fn total_unread_count(&self) -> u64 {
        self.router.read().await.total_unread_count()
    }

    pub async fn notifications(&self) -> Vec<NotificationEvent> {
        self.router.read().await.notifications().to_vec()
    }

    pub async fn notification_unread_count(&self) -> u64 {
        self.router.read().await.notification_unread_count()
    }

    pub async fn visible_popups(&self) -> Vec<Popup> {
        self.router.read().await.visible_popups()
    }

    pub async fn connection_status(&self, endpoint: &EndpointKey) -> Option<ConnectionStatus> {
        self.controller.status(endpoint).await
    }

    // ─── Internals ────────────────────────────────────────────────────────────

    fn emit(&self, event: ViewEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn send_frame(&self, conversation_id: &str, frame: &OutboundFrame) -> Result<SendOutcome> {
        if !self.config.enable_push {
            return Ok(SendOutcome::Unavailable);
        }
        self.controller
            .send(&EndpointKey::room(conversation_id), frame)
            .await
    }

    async fn is_me(&self, user_id: &str) -> bool {
        self.current_user
            .last_known()
            .await
            .is_some_and(|me| me.id == user_id)
    }

    /// Merge a batch into the engine and publish the list if it changed
    async fn apply_batch(&self, conversation_id: &str, batch: &[Message], ticket: Option<&FetchTicket>) {
        let messages = {
            let mut engine = self.engine.write().await;
            let before = engine.visible();
            let after = match ticket {
                Some(ticket) => engine.accept_fetch(ticket, batch),
                None => engine.ingest(conversation_id, batch),
            };
            after.filter(|list| *list != before)
        };
        if let Some(messages) = messages {
            self.emit(ViewEvent::MessagesChanged {
                conversation_id: conversation_id.to_string(),
                messages,
            });
        }
    }

    /// Fetch one target and route it through the same entry points as push
    async fn fetch(&self, target: PollTarget) -> Result<()> {
        match target {
            PollTarget::Conversations => {
                let list = self.api.list_conversations().await?;
                let (total_unread, unread_on_screen) = {
                    let mut router = self.router.write().await;
                    let total = router.refresh_conversations(list);
                    let ctx = self.context.current();
                    let on_screen = ctx
                        .active_conversation_id
                        .filter(|_| ctx.is_on_conversation_screen)
                        .filter(|id| {
                            router
                                .conversations()
                                .iter()
                                .any(|c| &c.id == id && c.unread_count > 0)
                        });
                    (total, on_screen)
                };
                self.emit(ViewEvent::ConversationsChanged { total_unread });
                if let Some(id) = unread_on_screen {
                    // Messages landed while the user was looking
                    self.spawn_mark_read(id);
                }
            }
            PollTarget::ActiveMessages => {
                let Some(ticket) = self.engine.read().await.fetch_ticket() else {
                    return Ok(());
                };
                let batch = self.api.list_messages(&ticket.conversation_id).await?;
                self.apply_batch(&ticket.conversation_id, &batch, Some(&ticket))
                    .await;
            }
            PollTarget::Notifications => {
                let feed = self
                    .api
                    .list_notifications(self.config.notification_feed_limit)
                    .await?;
                let unread_count = {
                    let mut router = self.router.write().await;
                    let popups = router.merge_notifications(feed.results, feed.unread_count);
                    if !popups.is_empty() {
                        debug!("{} new notifications from feed", popups.len());
                    }
                    router.notification_unread_count()
                };
                self.emit(ViewEvent::NotificationsChanged { unread_count });
            }
        }
        Ok(())
    }

    async fn initial_load(&self, target: PollTarget) {
        // Owns the target so the poller skips it meanwhile. A poll already
        // running (say for the previous conversation) finishes first.
        let _guard = self.in_flight.begin(target).await;
        match self.fetch(target).await {
            Ok(()) => {
                self.failed_initial.lock().await.remove(&target);
            }
            Err(e) => {
                warn!("Initial load of {} failed: {}", target, e);
                self.failed_initial.lock().await.insert(target);
                self.emit(ViewEvent::InitialLoadFailed {
                    target,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Background refetch, unless one is already running
    fn spawn_refresh(&self, target: PollTarget) {
        let Some(guard) = self.in_flight.try_begin(target) else {
            debug!("Refresh of {} already in flight", target);
            return;
        };
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.fetch(target).await {
                warn!("Refreshing {} failed: {}", target, e);
            }
            drop(guard);
        });
    }

    fn spawn_mark_read(&self, conversation_id: String) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.mark_conversation_read(&conversation_id).await {
                warn!("Failed to mark conversation {} read: {}", conversation_id, e);
            }
        });
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StatusChanged { endpoint, status } => {
                if status == ConnectionStatus::Disabled {
                    warn!("Push endpoint {} disabled, relying on polling", endpoint);
                }
                self.emit(ViewEvent::ConnectionChanged { endpoint, status });
            }
            ConnectionEvent::Push { endpoint, event } => self.handle_push(endpoint, event).await,
        }
    }

    async fn handle_push(&self, endpoint: EndpointKey, event: PushEvent) {
        match event {
            PushEvent::ChatMessage { message } => self.on_chat_message(message).await,
            PushEvent::Typing {
                user_id,
                display_name,
                is_typing,
            } => {
                let Some(conversation_id) = endpoint.conversation_id() else {
                    return;
                };
                if self.is_me(&user_id).await {
                    return;
                }
                self.emit(ViewEvent::Typing {
                    conversation_id: conversation_id.to_string(),
                    user_id,
                    display_name,
                    is_typing,
                });
            }
            PushEvent::Notification {
                notification,
                unread_count,
            } => {
                let about_message = matches!(notification.kind, NotificationKind::MessageArrival { .. });
                let stored = {
                    let mut router = self.router.write().await;
                    match router.on_notification(notification, unread_count) {
                        NotificationOutcome::Duplicate => None,
                        NotificationOutcome::Stored { .. } => Some(router.notification_unread_count()),
                    }
                };
                if let Some(unread_count) = stored {
                    self.emit(ViewEvent::NotificationsChanged { unread_count });
                    if about_message {
                        self.spawn_refresh(PollTarget::Conversations);
                    }
                }
            }
            PushEvent::EventNotification { event_id } => {
                debug!("Event notification {:?}, refetching feed", event_id);
                self.spawn_refresh(PollTarget::Notifications);
            }
            PushEvent::ConnectionEstablished { .. } => {
                // Catch up on whatever happened while the channel was down
                if endpoint.is_notifications() {
                    self.spawn_refresh(PollTarget::Conversations);
                    self.spawn_refresh(PollTarget::Notifications);
                } else {
                    self.spawn_refresh(PollTarget::ActiveMessages);
                }
            }
            PushEvent::NotificationUpdated {
                unread_count,
                notification_id,
                is_read,
            } => {
                {
                    let mut router = self.router.write().await;
                    if let (Some(id), Some(true)) = (notification_id.as_deref(), is_read) {
                        router.mark_notification_read(id);
                    }
                    router.apply_unread_correction(unread_count);
                }
                self.emit(ViewEvent::NotificationsChanged { unread_count });
            }
            PushEvent::UnreadCountUpdated { unread_count } => {
                self.router.write().await.apply_unread_correction(unread_count);
                self.emit(ViewEvent::NotificationsChanged { unread_count });
            }
        }
    }

    async fn on_chat_message(&self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        self.apply_batch(&conversation_id, std::slice::from_ref(&message), None)
            .await;

        if self.is_me(&message.sender_id).await {
            self.router.write().await.note_last_message(&message);
            return;
        }
        let outcome = self.router.write().await.route_message_arrival(&message);
        if outcome == ArrivalOutcome::Suppressed {
            self.spawn_mark_read(conversation_id);
        }
    }

    async fn run_popup_ticker(&self) {
        let mut ticker = interval(self.config.popup_tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }
            let changes = self.router.write().await.poll_due();
            for change in changes {
                let event = match change {
                    PopupChange::Shown(popup) => ViewEvent::PopupShown { popup },
                    PopupChange::Cancelled(popup_id) => ViewEvent::PopupCancelled { popup_id },
                    PopupChange::Retracted(popup_id) => ViewEvent::PopupRetracted { popup_id },
                };
                self.emit(event);
            }
        }
    }
}

#[async_trait]
impl PollSink for SyncClient {
    async fn poll(&self, target: PollTarget) -> Result<()> {
        if *self.shutdown.read().await {
            return Ok(());
        }
        self.fetch(target).await
    }
}

impl Clone for SyncClient {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            api: self.api.clone(),
            credentials: self.credentials.clone(),
            controller: self.controller.clone(),
            connection_events: self.connection_events.clone(),
            navigation: self.navigation.clone(),
            context: self.context.clone(),
            engine: self.engine.clone(),
            router: self.router.clone(),
            current_user: self.current_user.clone(),
            in_flight: self.in_flight.clone(),
            poller: self.poller.clone(),
            failed_initial: self.failed_initial.clone(),
            events: self.events.clone(),
            tasks: self.tasks.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}
