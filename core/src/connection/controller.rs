/// Connection controller: one push connection per endpoint key
use crate::connection::state::{
    Closure, ConnectionState, ConnectionStatus, EndpointKey, ReconnectDecision, ReconnectPolicy,
};
use crate::connection::transport::{InboundFrame, PushSocket, PushTransport};
use crate::credentials::CredentialSource;
use crate::error::Result;
use crate::protocol::{parse_push_frame, OutboundFrame, PushEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// What the controller tells its consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Push {
        endpoint: EndpointKey,
        event: PushEvent,
    },
    StatusChanged {
        endpoint: EndpointKey,
        status: ConnectionStatus,
    },
}

/// Result of `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Not open (or the write failed); use the request/response path
    Unavailable,
}

enum SocketCommand {
    Send(String, oneshot::Sender<Result<()>>),
    Close,
}

struct EndpointSlot {
    state: ConnectionState,
    /// Present only while the socket is open
    outbound: Option<mpsc::UnboundedSender<SocketCommand>>,
    task: Option<JoinHandle<()>>,
    /// Set on every fresh `connect`, so a superseded task can tell it lost
    epoch: u64,
}

impl EndpointSlot {
    fn new(key: EndpointKey) -> Self {
        Self {
            state: ConnectionState::new(key),
            outbound: None,
            task: None,
            epoch: 0,
        }
    }
}

/// Owns every endpoint's `ConnectionState`. Dependents only read snapshots.
#[derive(Clone)]
pub struct ConnectionController {
    transport: Arc<dyn PushTransport>,
    /// Re-read before every automatic reconnect
    credentials: Arc<dyn CredentialSource>,
    policy: ReconnectPolicy,
    endpoints: Arc<RwLock<HashMap<EndpointKey, EndpointSlot>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_epoch: Arc<AtomicU64>,
}

impl ConnectionController {
    /// Create a controller and the receiving end of its event stream
    pub fn new(
        transport: Arc<dyn PushTransport>,
        credentials: Arc<dyn CredentialSource>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            transport,
            credentials,
            policy,
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            events,
            next_epoch: Arc::new(AtomicU64::new(1)),
        };
        (controller, rx)
    }

    /// Open `key` unless it is already Open, Connecting or Disabled.
    /// Without credentials this does nothing; call again once they exist.
    pub async fn connect(&self, key: &EndpointKey, credentials: Option<&str>) {
        let Some(token) = credentials.filter(|t| !t.is_empty()) else {
            debug!("No credentials for {}, not connecting", key);
            return;
        };

        let mut endpoints = self.endpoints.write().await;
        let slot = endpoints
            .entry(key.clone())
            .or_insert_with(|| EndpointSlot::new(key.clone()));
        if !slot.state.begin_connect() {
            debug!("Connect to {} ignored ({:?})", key, slot.state.status);
            return;
        }
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        slot.epoch = epoch;
        if let Some(old) = slot.task.take() {
            // A task still sleeping before its own reconnect
            old.abort();
        }
        self.emit(ConnectionEvent::StatusChanged {
            endpoint: key.clone(),
            status: ConnectionStatus::Connecting,
        });

        let controller = self.clone();
        let task_key = key.clone();
        let token = token.to_string();
        slot.task = Some(tokio::spawn(async move {
            controller.run_endpoint(task_key, token, epoch).await;
        }));
    }

    /// Send one frame. Only succeeds while the endpoint is Open.
    pub async fn send(&self, key: &EndpointKey, frame: &OutboundFrame) -> Result<SendOutcome> {
        let text = frame.to_text()?;
        let outbound = {
            let endpoints = self.endpoints.read().await;
            match endpoints.get(key) {
                Some(slot) if slot.state.is_open() => slot.outbound.clone(),
                _ => None,
            }
        };
        let Some(outbound) = outbound else {
            return Ok(SendOutcome::Unavailable);
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if outbound.send(SocketCommand::Send(text, ack_tx)).is_err() {
            return Ok(SendOutcome::Unavailable);
        }
        match ack_rx.await {
            Ok(Ok(())) => Ok(SendOutcome::Sent),
            Ok(Err(e)) => {
                warn!("Send on {} failed: {}", key, e);
                Ok(SendOutcome::Unavailable)
            }
            Err(_) => Ok(SendOutcome::Unavailable),
        }
    }

    /// Close `key` on purpose and forget it. Cancels any scheduled reconnect.
    pub async fn disconnect(&self, key: &EndpointKey) {
        let slot = self.endpoints.write().await.remove(key);
        let Some(slot) = slot else {
            return;
        };
        Self::close_slot(key, slot);
        self.emit(ConnectionEvent::StatusChanged {
            endpoint: key.clone(),
            status: ConnectionStatus::Closed,
        });
    }

    /// Explicitly close every endpoint (logout / teardown)
    pub async fn shutdown(&self) {
        let drained: Vec<(EndpointKey, EndpointSlot)> =
            self.endpoints.write().await.drain().collect();
        for (key, slot) in drained {
            Self::close_slot(&key, slot);
        }
        info!("Connection controller shut down");
    }

    /// Forget everything, including disabled endpoints (new login session)
    pub async fn reset_session(&self) {
        self.shutdown().await;
    }

    pub async fn status(&self, key: &EndpointKey) -> Option<ConnectionStatus> {
        self.endpoints.read().await.get(key).map(|s| s.state.status)
    }

    pub async fn is_disabled(&self, key: &EndpointKey) -> bool {
        self.status(key).await == Some(ConnectionStatus::Disabled)
    }

    pub async fn snapshot(&self, key: &EndpointKey) -> Option<ConnectionState> {
        self.endpoints.read().await.get(key).map(|s| s.state.clone())
    }

    fn close_slot(key: &EndpointKey, slot: EndpointSlot) {
        match slot.outbound {
            Some(outbound) => {
                // Task closes the socket cleanly, then finds its slot gone and exits
                if outbound.send(SocketCommand::Close).is_err() {
                    if let Some(task) = slot.task {
                        task.abort();
                    }
                }
            }
            None => {
                if let Some(task) = slot.task {
                    task.abort();
                }
            }
        }
        debug!("Closed endpoint {}", key);
    }

    fn bearer(&self) -> Option<String> {
        self.credentials.bearer().filter(|t| !t.is_empty())
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            debug!("Connection event dropped, no consumer");
        }
    }

    /// Connect / pump / reconnect loop for one endpoint
    async fn run_endpoint(&self, key: EndpointKey, mut token: String, epoch: u64) {
        loop {
            let closure = match self.transport.connect(&key, &token).await {
                Ok(socket) => {
                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                    let still_wanted = {
                        let mut endpoints = self.endpoints.write().await;
                        match endpoints.get_mut(&key) {
                            Some(slot) if slot.epoch == epoch => {
                                slot.state.on_open();
                                slot.outbound = Some(cmd_tx);
                                true
                            }
                            _ => false,
                        }
                    };
                    if !still_wanted {
                        let mut socket = socket;
                        let _ = socket.close().await;
                        return;
                    }
                    info!("Push channel {} open", key);
                    self.emit(ConnectionEvent::StatusChanged {
                        endpoint: key.clone(),
                        status: ConnectionStatus::Open,
                    });
                    self.pump(&key, socket, cmd_rx).await
                }
                Err(e) => {
                    warn!("Failed to connect {}: {}", key, e);
                    Closure::abnormal(e.to_string())
                }
            };

            let decision = {
                let mut endpoints = self.endpoints.write().await;
                let Some(slot) = endpoints.get_mut(&key) else {
                    debug!("Endpoint {} was removed, stopping", key);
                    return;
                };
                if slot.epoch != epoch {
                    return;
                }
                slot.outbound = None;
                let mut decision = slot.state.on_close(&closure, &self.policy);
                if matches!(decision, ReconnectDecision::Reconnect(_)) && self.bearer().is_none() {
                    info!("Credentials for {} revoked, not reconnecting", key);
                    decision = ReconnectDecision::Stay;
                }
                (decision, slot.state.status, slot.state.consecutive_failure_count)
            };
            let (decision, status, failures) = decision;
            self.emit(ConnectionEvent::StatusChanged {
                endpoint: key.clone(),
                status,
            });

            match decision {
                ReconnectDecision::Reconnect(delay) => {
                    info!(
                        "Push channel {} closed abnormally ({} in a row), reconnecting in {:?}",
                        key, failures, delay
                    );
                    sleep(delay).await;
                    let Some(fresh) = self.bearer() else {
                        info!("Credentials for {} revoked while waiting, not reconnecting", key);
                        return;
                    };
                    token = fresh;
                    let resumed = {
                        let mut endpoints = self.endpoints.write().await;
                        match endpoints.get_mut(&key) {
                            Some(slot) if slot.epoch == epoch => slot.state.begin_connect(),
                            _ => false,
                        }
                    };
                    if !resumed {
                        return;
                    }
                    self.emit(ConnectionEvent::StatusChanged {
                        endpoint: key.clone(),
                        status: ConnectionStatus::Connecting,
                    });
                }
                ReconnectDecision::Stay => {
                    debug!("Push channel {} closed cleanly", key);
                    return;
                }
                ReconnectDecision::Disable => {
                    error!(
                        "Push channel {} disabled after {} consecutive failures; falling back to polling",
                        key, failures
                    );
                    return;
                }
            }
        }
    }

    /// Move frames both ways until the socket ends
    async fn pump(
        &self,
        key: &EndpointKey,
        mut socket: Box<dyn PushSocket>,
        mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    ) -> Closure {
        loop {
            tokio::select! {
                frame = socket.next_frame() => {
                    match frame {
                        Some(Ok(InboundFrame::Text(text))) => self.deliver(key, &text),
                        Some(Ok(InboundFrame::Close(code))) => {
                            debug!("Push channel {} got close frame {:?}", key, code);
                            return Closure::from_code(code);
                        }
                        Some(Err(e)) => return Closure::abnormal(e.to_string()),
                        None => return Closure::abnormal("stream ended without close frame"),
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(SocketCommand::Send(text, ack)) => {
                            let result = socket.send_text(text).await;
                            let failed = result.as_ref().err().map(|e| e.to_string());
                            let _ = ack.send(result);
                            if let Some(reason) = failed {
                                return Closure::abnormal(reason);
                            }
                        }
                        Some(SocketCommand::Close) | None => {
                            if let Err(e) = socket.close().await {
                                debug!("Close handshake on {} failed: {}", key, e);
                            }
                            return Closure::explicit();
                        }
                    }
                }
            }
        }
    }

    fn deliver(&self, key: &EndpointKey, text: &str) {
        match parse_push_frame(text) {
            Ok(event) => {
                debug!("Received {} on {}", event, key);
                self.emit(ConnectionEvent::Push {
                    endpoint: key.clone(),
                    event,
                });
            }
            Err(e) => warn!("Discarding malformed frame on {}: {}", key, e),
        }
    }
}
