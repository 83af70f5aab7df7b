/// chatsync - terminal front end for the sync client
use chatsync_core::api::HttpChatApi;
use chatsync_core::clock::SystemClock;
use chatsync_core::connection::WsTransport;
use chatsync_core::context::ActiveContext;
use chatsync_core::credentials::{CredentialSource, EnvCredentials, StaticCredentials};
use chatsync_core::{Config, SyncClient, ViewEvent};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let credentials: Arc<dyn CredentialSource> = match config.token.clone() {
        Some(token) => Arc::new(StaticCredentials::new(token)),
        None => Arc::new(EnvCredentials),
    };
    if credentials.bearer().is_none() {
        warn!("No token given (--token or CHATSYNC_TOKEN); push channel stays closed");
    }

    let api = Arc::new(HttpChatApi::new(
        config.base_url.clone(),
        credentials.clone(),
        config.request_timeout,
    ));
    let transport = Arc::new(WsTransport::new(config.ws_base()));
    info!("🚀 Starting chatsync");
    info!("   API: {}", config.base_url);
    info!("   Push: {}", if config.enable_push { config.ws_base() } else { "disabled".to_string() });

    let client = SyncClient::new(config, api, transport, credentials, Arc::new(SystemClock));

    let mut events = client.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_view_event(&event),
                Err(RecvError::Lagged(n)) => warn!("View log lagged {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    client.start().await
        .map_err(|e| anyhow::anyhow!("Start error: {}", e))?;

    tokio::select! {
        _ = read_commands(&client) => {},
        _ = wait_for_shutdown() => {},
    }

    client.shutdown().await;
    logger.abort();
    Ok(())
}

/// Line commands on stdin:
///   /open <id>   view a conversation
///   /away        leave the conversation screen (keeps it active)
///   /close       close the conversation
///   /read-all    mark every notification read
///   /retry       retry failed initial loads
///   /quit
/// Anything else is sent to the open conversation.
async fn read_commands(client: &SyncClient) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Reading stdin failed: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(2, ' ');
        match (parts.next().unwrap_or(""), parts.next()) {
            ("/open", Some(id)) => client.navigate(ActiveContext::viewing(id.trim())).await,
            ("/away", _) => {
                let active = client.context().current().active_conversation_id;
                client.navigate(ActiveContext::away(active)).await;
            }
            ("/close", _) => client.navigate(ActiveContext::away(None)).await,
            ("/read-all", _) => {
                if let Err(e) = client.mark_all_notifications_read().await {
                    warn!("Mark all read failed: {}", e);
                }
            }
            ("/retry", _) => client.retry_initial_load().await,
            ("/quit", _) => break,
            _ => match client.active_conversation().await {
                Some(conversation) => {
                    if let Err(e) = client.send_message(&conversation, line).await {
                        warn!("Message not sent: {}", e);
                    }
                }
                None => warn!("No conversation open; use /open <id>"),
            },
        }
    }
}

fn log_view_event(event: &ViewEvent) {
    match event {
        ViewEvent::ConnectionChanged { endpoint, status } => {
            info!("Push {} is {:?}", endpoint, status)
        }
        ViewEvent::MessagesChanged { conversation_id, messages } => {
            info!("Conversation {} now shows {} messages", conversation_id, messages.len());
            if let Some(last) = messages.last() {
                info!("   {:?} {}: {}", last.delivery, last.message.sender_display_name, last.message.body);
            }
        }
        ViewEvent::ConversationsChanged { total_unread } => info!("Unread messages: {}", total_unread),
        ViewEvent::NotificationsChanged { unread_count } => info!("Unread notifications: {}", unread_count),
        ViewEvent::PopupShown { popup } => info!("🔔 {}: {}", popup.title, popup.body),
        ViewEvent::PopupCancelled { .. } | ViewEvent::PopupRetracted { .. } => {}
        ViewEvent::Typing { display_name, is_typing: true, .. } => info!("{} is typing...", display_name),
        ViewEvent::Typing { .. } => {}
        ViewEvent::SendFailed { restore_text, error, .. } => {
            warn!("Send failed ({}); unsent text: {}", error, restore_text)
        }
        ViewEvent::InitialLoadFailed { target, error } => {
            warn!("Loading {} failed: {} (type /retry)", target, error)
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
