/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Sync client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// REST base URL (`http://host:port`)
    pub base_url: String,

    /// Push channel base URL; derived from `base_url` when absent
    pub ws_url: Option<String>,

    /// Bearer token; falls back to `CHATSYNC_TOKEN` when absent
    pub token: Option<String>,

    /// Conversation to open on startup
    pub initial_conversation: Option<String>,

    /// Use the push channel at all (off = polling + direct requests only)
    pub enable_push: bool,

    /// Delay before reconnecting after an abnormal close
    pub reconnect_delay: Duration,

    /// Abnormal closes in a row before an endpoint is disabled for the session
    pub max_consecutive_failures: u32,

    /// Conversation list + active conversation poll interval
    pub conversation_poll_interval: Duration,

    /// Notification feed poll interval
    pub notification_poll_interval: Duration,

    /// Max distance between a pending message and its server copy
    pub pending_match_window: Duration,

    /// Delay before a scheduled popup is re-checked against the active context
    pub popup_suppression_delay: Duration,

    /// Auto-dismiss for message popups
    pub message_popup_timeout: Duration,

    /// Auto-dismiss for scheduling reminder popups
    pub reminder_popup_timeout: Duration,

    /// Notification ids remembered for dedup
    pub recent_notification_capacity: usize,

    /// Notifications kept in the local feed
    pub notification_feed_limit: usize,

    /// How often due popups are evaluated
    pub popup_tick_interval: Duration,

    /// Per-request timeout for the REST path
    pub request_timeout: Duration,

    /// How long the current user profile is reused before refetching
    pub current_user_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: None,
            token: None,
            initial_conversation: None,
            enable_push: true,
            reconnect_delay: Duration::from_secs(3),
            max_consecutive_failures: 3,
            conversation_poll_interval: Duration::from_secs(5),
            notification_poll_interval: Duration::from_secs(10),
            pending_match_window: Duration::from_secs(5),
            popup_suppression_delay: Duration::from_millis(500),
            message_popup_timeout: Duration::from_secs(5),
            reminder_popup_timeout: Duration::from_secs(8),
            recent_notification_capacity: 256,
            notification_feed_limit: 100,
            popup_tick_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(15),
            current_user_ttl: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Config::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--token" => {
                    let token = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--token requires a value".to_string())
                    })?;
                    config.token = Some(token.clone());
                    i += 2;
                }
                "--conversation" => {
                    let id = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--conversation requires an id".to_string())
                    })?;
                    config.initial_conversation = Some(id.clone());
                    i += 2;
                }
                "--ws-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--ws-url requires a URL".to_string())
                    })?;
                    config.ws_url = Some(url.trim_end_matches('/').to_string());
                    i += 2;
                }
                "--poll-secs" => {
                    config.conversation_poll_interval =
                        Duration::from_secs(parse_flag(args, i, "--poll-secs")?);
                    i += 2;
                }
                "--notification-poll-secs" => {
                    config.notification_poll_interval =
                        Duration::from_secs(parse_flag(args, i, "--notification-poll-secs")?);
                    i += 2;
                }
                "--reconnect-delay-ms" => {
                    config.reconnect_delay =
                        Duration::from_millis(parse_flag(args, i, "--reconnect-delay-ms")?);
                    i += 2;
                }
                "--max-failures" => {
                    let n = parse_flag(args, i, "--max-failures")?;
                    config.max_consecutive_failures = u32::try_from(n).map_err(|_| {
                        SyncError::Config("--max-failures is out of range".to_string())
                    })?;
                    i += 2;
                }
                "--no-push" => {
                    config.enable_push = false;
                    i += 1;
                }
                other if other.starts_with("--") => {
                    return Err(SyncError::Config(format!(
                        "Unknown flag {}. Usage: {} [base_url] [--token <t>] [--conversation <id>] [--ws-url <url>] [--poll-secs <n>] [--notification-poll-secs <n>] [--reconnect-delay-ms <n>] [--max-failures <n>] [--no-push]",
                        other,
                        args.first().map(String::as_str).unwrap_or("chatsync")
                    )));
                }
                other => {
                    config.base_url = other.trim_end_matches('/').to_string();
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATSYNC_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("CHATSYNC_WS_URL") {
            config.ws_url = Some(url.trim_end_matches('/').to_string());
        }
        if std::env::var("CHATSYNC_NO_PUSH").is_ok() {
            config.enable_push = false;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "base URL must start with http:// or https://, got {}",
                self.base_url
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(SyncError::Config(
                "max consecutive failures must be at least 1".to_string(),
            ));
        }
        if self.conversation_poll_interval.is_zero() || self.notification_poll_interval.is_zero() {
            return Err(SyncError::Config("poll intervals must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Push channel base (`ws://` / `wss://`)
    pub fn ws_base(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.clone();
        }
        if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        }
    }
}

fn parse_flag(args: &[String], i: usize, flag: &str) -> Result<u64> {
    let raw = args
        .get(i + 1)
        .ok_or_else(|| SyncError::Config(format!("{} requires a number", flag)))?;
    raw.parse::<u64>()
        .map_err(|_| SyncError::Config(format!("{} must be a non-negative number", flag)))
}
