/// Per-endpoint connection state and reconnect policy
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// WebSocket close code for a normal closure
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Logical push endpoint ("room updates" for one conversation, or the
/// global notification stream)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey(String);

const ROOM_PREFIX: &str = "room:";
const NOTIFICATIONS_KEY: &str = "notifications";

impl EndpointKey {
    pub fn room(conversation_id: &str) -> Self {
        Self(format!("{}{}", ROOM_PREFIX, conversation_id))
    }

    pub fn notifications() -> Self {
        Self(NOTIFICATIONS_KEY.to_string())
    }

    /// Conversation id for room endpoints
    pub fn conversation_id(&self) -> Option<&str> {
        self.0.strip_prefix(ROOM_PREFIX)
    }

    pub fn is_notifications(&self) -> bool {
        self.0 == NOTIFICATIONS_KEY
    }

    /// Server path for this endpoint
    pub fn path(&self) -> String {
        match self.conversation_id() {
            Some(id) => format!("/ws/chat/{}/", urlencoding::encode(id)),
            None => "/ws/notifications/".to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection status of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Known but never connected
    Idle,
    /// Handshake in flight
    Connecting,
    /// Ready to send and receive
    Open,
    /// Closed; may be waiting for a scheduled reconnect
    Closed,
    /// Circuit open. Terminal until the session is reset.
    Disabled,
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    pub clean: bool,
    /// We closed it on purpose (navigation, logout, revoked credentials)
    pub explicit: bool,
    pub reason: Option<String>,
}

impl Closure {
    /// Local, intentional close. Always clean.
    pub fn explicit() -> Self {
        Self {
            clean: true,
            explicit: true,
            reason: None,
        }
    }

    /// Server close frame. Only code 1000 counts as clean.
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(NORMAL_CLOSE_CODE) => Self {
                clean: true,
                explicit: false,
                reason: None,
            },
            Some(code) => Self::abnormal(format!("closed with code {}", code)),
            None => Self::abnormal("closed without status code"),
        }
    }

    /// Transport error, dropped stream, failed handshake
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            clean: false,
            explicit: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_consecutive_failures: 3,
        }
    }
}

/// What to do after a close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Reconnect(Duration),
    Stay,
    Disable,
}

/// Snapshot of one endpoint. Owned by the controller; everyone else gets clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub endpoint_key: EndpointKey,
    pub status: ConnectionStatus,
    pub consecutive_failure_count: u32,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn new(endpoint_key: EndpointKey) -> Self {
        Self {
            endpoint_key,
            status: ConnectionStatus::Idle,
            consecutive_failure_count: 0,
            last_error: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.status == ConnectionStatus::Disabled
    }

    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Open
    }

    /// Move to Connecting. False when already Open/Connecting or Disabled.
    pub fn begin_connect(&mut self) -> bool {
        match self.status {
            ConnectionStatus::Idle | ConnectionStatus::Closed => {
                self.status = ConnectionStatus::Connecting;
                true
            }
            ConnectionStatus::Connecting | ConnectionStatus::Open | ConnectionStatus::Disabled => {
                false
            }
        }
    }

    /// Leaves the failure count alone; only a clean close resets it
    pub fn on_open(&mut self) {
        self.status = ConnectionStatus::Open;
    }

    /// Record a close and decide whether to come back
    pub fn on_close(&mut self, closure: &Closure, policy: &ReconnectPolicy) -> ReconnectDecision {
        if self.is_disabled() {
            return ReconnectDecision::Disable;
        }
        self.status = ConnectionStatus::Closed;

        if closure.clean {
            self.consecutive_failure_count = 0;
        } else {
            self.consecutive_failure_count += 1;
            self.last_error = closure.reason.clone();
        }

        if self.consecutive_failure_count >= policy.max_consecutive_failures {
            self.status = ConnectionStatus::Disabled;
            return ReconnectDecision::Disable;
        }
        if closure.explicit || closure.clean {
            return ReconnectDecision::Stay;
        }
        ReconnectDecision::Reconnect(policy.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keys() {
        let room = EndpointKey::room("42");
        assert_eq!(room.conversation_id(), Some("42"));
        assert_eq!(room.path(), "/ws/chat/42/");
        let notes = EndpointKey::notifications();
        assert!(notes.is_notifications());
        assert_eq!(notes.conversation_id(), None);
        assert_eq!(notes.path(), "/ws/notifications/");
    }

    #[test]
    fn test_connect_is_noop_when_busy() {
        let mut state = ConnectionState::new(EndpointKey::notifications());
        assert!(state.begin_connect());
        assert!(!state.begin_connect());
        state.on_open();
        assert!(!state.begin_connect());
    }

    #[test]
    fn test_abnormal_close_schedules_reconnect() {
        let policy = ReconnectPolicy::default();
        let mut state = ConnectionState::new(EndpointKey::notifications());
        state.begin_connect();
        state.on_open();
        let decision = state.on_close(&Closure::from_code(Some(1006)), &policy);
        assert_eq!(decision, ReconnectDecision::Reconnect(Duration::from_secs(3)));
        assert_eq!(state.consecutive_failure_count, 1);
        assert_eq!(state.status, ConnectionStatus::Closed);
        assert!(state.last_error.is_some());
    }

    #[test]
    fn test_clean_close_resets_and_stays() {
        let policy = ReconnectPolicy::default();
        let mut state = ConnectionState::new(EndpointKey::notifications());
        state.begin_connect();
        state.on_close(&Closure::abnormal("reset"), &policy);
        state.begin_connect();
        state.on_open();
        let decision = state.on_close(&Closure::from_code(Some(NORMAL_CLOSE_CODE)), &policy);
        assert_eq!(decision, ReconnectDecision::Stay);
        assert_eq!(state.consecutive_failure_count, 0);
    }

    #[test]
    fn test_explicit_close_never_reconnects() {
        let policy = ReconnectPolicy::default();
        let mut state = ConnectionState::new(EndpointKey::room("1"));
        state.begin_connect();
        state.on_open();
        assert_eq!(state.on_close(&Closure::explicit(), &policy), ReconnectDecision::Stay);
        assert_eq!(state.consecutive_failure_count, 0);
    }

    #[test]
    fn test_circuit_opens_after_three_failures() {
        let policy = ReconnectPolicy::default();
        let mut state = ConnectionState::new(EndpointKey::notifications());
        for expected in 1..=2 {
            assert!(state.begin_connect());
            state.on_open();
            let d = state.on_close(&Closure::from_code(None), &policy);
            assert_eq!(d, ReconnectDecision::Reconnect(policy.delay));
            assert_eq!(state.consecutive_failure_count, expected);
        }
        assert!(state.begin_connect());
        let d = state.on_close(&Closure::abnormal("handshake failed"), &policy);
        assert_eq!(d, ReconnectDecision::Disable);
        assert!(state.is_disabled());

        // Terminal: manual connects are no-ops
        assert!(!state.begin_connect());
        assert_eq!(
            state.on_close(&Closure::from_code(Some(NORMAL_CLOSE_CODE)), &policy),
            ReconnectDecision::Disable
        );
        assert!(state.is_disabled());
    }
}
