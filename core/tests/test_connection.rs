/// Connection controller tests
/// Reconnect policy, circuit breaker and send semantics against an in-memory transport

extern crate chatsync_core;

mod common;

use chatsync_core::connection::{
    ConnectionController, ConnectionEvent, ConnectionStatus, EndpointKey, ReconnectPolicy,
    SendOutcome,
};
use chatsync_core::protocol::{OutboundFrame, PushEvent};
use chatsync_core::credentials::StaticCredentials;
use common::{FakeTransport, WAIT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Instant};

fn controller_for(
    transport: &Arc<FakeTransport>,
) -> (
    ConnectionController,
    UnboundedReceiver<ConnectionEvent>,
    Arc<StaticCredentials>,
) {
    let credentials = Arc::new(StaticCredentials::new("tok"));
    let (controller, events) = ConnectionController::new(
        transport.clone(),
        credentials.clone(),
        ReconnectPolicy::default(),
    );
    (controller, events, credentials)
}

async fn wait_status(events: &mut UnboundedReceiver<ConnectionEvent>, want: ConnectionStatus) {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let ConnectionEvent::StatusChanged { status, .. } = event {
                if status == want {
                    return;
                }
            }
        }
        panic!("connection events closed");
    };
    timeout(WAIT * 10, wait)
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}", want));
}

async fn next_push(events: &mut UnboundedReceiver<ConnectionEvent>) -> PushEvent {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let ConnectionEvent::Push { event, .. } = event {
                return event;
            }
        }
        panic!("connection events closed");
    };
    timeout(WAIT, wait).await.expect("no push event")
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_after_three_failed_handshakes() {
    let transport = FakeTransport::new();
    transport.refuse(true);
    let (controller, mut events, _credentials) = controller_for(&transport);
    let key = EndpointKey::notifications();

    let started = Instant::now();
    controller.connect(&key, Some("tok")).await;
    wait_status(&mut events, ConnectionStatus::Disabled).await;

    // Two 3 s waits between the three attempts
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    assert_eq!(transport.attempts(), 3);
    assert!(controller.is_disabled(&key).await);
    let snapshot = controller.snapshot(&key).await.unwrap();
    assert_eq!(snapshot.consecutive_failure_count, 3);
    assert!(snapshot.last_error.is_some());

    // No more automatic attempts, and a manual connect is a no-op
    sleep(Duration::from_secs(60)).await;
    controller.connect(&key, Some("tok")).await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.attempts(), 3);

    // A new session starts from scratch
    controller.reset_session().await;
    assert_eq!(controller.status(&key).await, None);
    controller.connect(&key, Some("tok")).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.attempts(), 4);
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_open_then_drop_still_trips_breaker() {
    let transport = FakeTransport::new();
    let (controller, mut events, _credentials) = controller_for(&transport);
    let key = EndpointKey::room("42");
    controller.connect(&key, Some("tok")).await;

    for _ in 0..3 {
        let end = transport.accept(&key).await;
        assert_eq!(end.token, "tok");
        wait_status(&mut events, ConnectionStatus::Open).await;
        // Stream ends without a close frame
        drop(end);
    }
    wait_status(&mut events, ConnectionStatus::Disabled).await;

    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempts(), 3);
    assert!(controller.is_disabled(&key).await);
}

#[tokio::test(start_paused = true)]
async fn test_clean_close_resets_count_and_stays_closed() {
    let transport = FakeTransport::new();
    let (controller, mut events, _credentials) = controller_for(&transport);
    let key = EndpointKey::notifications();
    controller.connect(&key, Some("tok")).await;

    let first = transport.accept(&key).await;
    wait_status(&mut events, ConnectionStatus::Open).await;
    first.close(Some(1011));
    wait_status(&mut events, ConnectionStatus::Closed).await;
    assert_eq!(
        controller.snapshot(&key).await.unwrap().consecutive_failure_count,
        1
    );

    let second = transport.accept(&key).await;
    wait_status(&mut events, ConnectionStatus::Open).await;
    second.close(Some(1000));
    wait_status(&mut events, ConnectionStatus::Closed).await;

    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempts(), 2);
    let snapshot = controller.snapshot(&key).await.unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Closed);
    assert_eq!(snapshot.consecutive_failure_count, 0);

    // Closed (not Disabled): a manual connect goes through
    controller.connect(&key, Some("tok")).await;
    let _third = transport.accept(&key).await;
    assert_eq!(transport.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_send_only_while_open() {
    let transport = FakeTransport::new();
    let (controller, mut events, _credentials) = controller_for(&transport);
    let key = EndpointKey::room("7");
    let frame = OutboundFrame::ChatMessage {
        content: "hi".to_string(),
    };

    assert_eq!(controller.send(&key, &frame).await.unwrap(), SendOutcome::Unavailable);

    controller.connect(&key, Some("tok")).await;
    let mut end = transport.accept(&key).await;
    wait_status(&mut events, ConnectionStatus::Open).await;
    assert_eq!(controller.send(&key, &frame).await.unwrap(), SendOutcome::Sent);
    let sent = end.next_sent().await;
    assert_eq!(sent["type"], "chat_message");
    assert_eq!(sent["content"], "hi");

    end.close(Some(4000));
    wait_status(&mut events, ConnectionStatus::Closed).await;
    assert_eq!(controller.send(&key, &frame).await.unwrap(), SendOutcome::Unavailable);
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_scheduled_reconnect() {
    let transport = FakeTransport::new();
    transport.refuse(true);
    let (controller, mut events, _credentials) = controller_for(&transport);
    let key = EndpointKey::room("9");

    controller.connect(&key, Some("tok")).await;
    wait_status(&mut events, ConnectionStatus::Closed).await;
    controller.disconnect(&key).await;
    assert_eq!(controller.status(&key).await, None);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped() {
    let transport = FakeTransport::new();
    let (controller, mut events, _credentials) = controller_for(&transport);
    let key = EndpointKey::notifications();
    controller.connect(&key, Some("tok")).await;

    let end = transport.accept(&key).await;
    end.push_raw("{not json");
    end.push_raw(r#"{"type":"mystery","x":1}"#);
    end.push_raw(r#"{"unread_count":3}"#);
    end.push(serde_json::json!({"type": "unread_count_updated", "unread_count": 4}));

    assert_eq!(
        next_push(&mut events).await,
        PushEvent::UnreadCountUpdated { unread_count: 4 }
    );
    assert_eq!(controller.status(&key).await, Some(ConnectionStatus::Open));
}

#[tokio::test(start_paused = true)]
async fn test_connect_without_credentials_does_nothing() {
    let transport = FakeTransport::new();
    let (controller, _events, _credentials) = controller_for(&transport);
    let key = EndpointKey::notifications();

    controller.connect(&key, None).await;
    controller.connect(&key, Some("")).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.attempts(), 0);
    assert_eq!(controller.status(&key).await, None);

    // Credentials showed up
    controller.connect(&key, Some("tok")).await;
    controller.connect(&key, Some("tok")).await;
    let _end = transport.accept(&key).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(controller.status(&key).await, Some(ConnectionStatus::Open));
}

#[tokio::test(start_paused = true)]
async fn test_revoked_credentials_stop_reconnects() {
    let transport = FakeTransport::new();
    let (controller, mut events, credentials) = controller_for(&transport);
    let key = EndpointKey::notifications();
    controller.connect(&key, Some("tok")).await;

    let end = transport.accept(&key).await;
    wait_status(&mut events, ConnectionStatus::Open).await;
    credentials.set(None);
    end.close(Some(1006));
    wait_status(&mut events, ConnectionStatus::Closed).await;

    sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(controller.status(&key).await, Some(ConnectionStatus::Closed));

    // A fresh login connects again
    credentials.set(Some("tok2".to_string()));
    controller.connect(&key, Some("tok2")).await;
    let end = transport.accept(&key).await;
    assert_eq!(end.token, "tok2");
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_picks_up_refreshed_token() {
    let transport = FakeTransport::new();
    let (controller, mut events, credentials) = controller_for(&transport);
    let key = EndpointKey::room("5");
    controller.connect(&key, Some("tok")).await;

    let end = transport.accept(&key).await;
    wait_status(&mut events, ConnectionStatus::Open).await;
    credentials.set(Some("rotated".to_string()));
    end.close(Some(1011));

    let end = transport.accept(&key).await;
    assert_eq!(end.token, "rotated");
    assert_eq!(transport.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_revoked_during_reconnect_wait() {
    let transport = FakeTransport::new();
    let (controller, mut events, credentials) = controller_for(&transport);
    let key = EndpointKey::room("6");
    controller.connect(&key, Some("tok")).await;

    let end = transport.accept(&key).await;
    wait_status(&mut events, ConnectionStatus::Open).await;
    end.close(Some(1006));
    wait_status(&mut events, ConnectionStatus::Closed).await;
    credentials.set(None);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(controller.status(&key).await, Some(ConnectionStatus::Closed));
}
