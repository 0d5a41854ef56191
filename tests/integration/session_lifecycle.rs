// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for the real-time session against an in-process broker.
//!
//! These tests validate:
//! - `connect` authenticates and subscribes the user's notification feed
//! - Notification pushes reach only the target user
//! - Malformed pushes are dropped without losing the subscription
//! - A second `connect` while connected is a no-op
//! - A broker-side close clears the registry and a reconnect works
//! - Operations after `disconnect` fail with `NotConnected`

use std::sync::Arc;
use std::time::Duration;

use crmsync::credentials::Credentials;
use crmsync::session::{ConnectionState, Session, SessionError};
use crmsync::transport::ws::WsConnector;
use crmsync_broker::auth::TokenTable;
use crmsync_broker::broker::{BrokerState, NotifyResponse, start_server_with_state};
use crmsync_proto::notification::{Notification, NotificationType};
use crmsync_proto::topic::{Topic, USER_NOTIFICATION_DESTINATION};
use tokio::sync::mpsc;
use url::Url;

struct Broker {
    addr: std::net::SocketAddr,
    state: Arc<BrokerState>,
    _handle: tokio::task::JoinHandle<()>,
}

impl Broker {
    async fn start() -> Self {
        let tokens = TokenTable::from_pairs([("tok-alice", "alice"), ("tok-bob", "bob")]);
        let state = Arc::new(BrokerState::new(tokens));
        let (addr, handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .expect("failed to start broker");
        Self {
            addr,
            state,
            _handle: handle,
        }
    }

    fn session(&self, token: &str, username: &str) -> Session<WsConnector> {
        let url = Url::parse(&format!("ws://{}/ws", self.addr)).unwrap();
        Session::new(WsConnector::new(url), Credentials::with_login(token, username))
    }

    async fn wait_for_feeds(&self, n: usize) {
        for _ in 0..200 {
            if self.state.subscriber_count(USER_NOTIFICATION_DESTINATION).await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("broker never saw {n} notification subscriptions");
    }
}

/// Connect `session` with a handler forwarding notifications to a channel.
async fn connect_collecting(
    session: &Session<WsConnector>,
) -> mpsc::UnboundedReceiver<Notification> {
    let (tx, rx) = mpsc::unbounded_channel();
    session
        .connect(move |n| {
            let _ = tx.send(n);
        })
        .await
        .expect("connect failed");
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("channel closed")
}

fn comment_notification(id: i64) -> Notification {
    Notification::new(id, NotificationType::TaskNewComment).with_param("task_description", "Call back")
}

#[tokio::test]
async fn connect_subscribes_user_feed() {
    let broker = Broker::start().await;
    let session = broker.session("tok-alice", "alice");
    let _rx = connect_collecting(&session).await;

    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(
        session
            .registry()
            .contains(&Topic::UserNotificationFeed("alice".into()))
    );
    broker.wait_for_feeds(1).await;
}

#[tokio::test]
async fn pushed_notification_reaches_handler() {
    let broker = Broker::start().await;
    let session = broker.session("tok-alice", "alice");
    let mut rx = connect_collecting(&session).await;
    broker.wait_for_feeds(1).await;

    let body = serde_json::to_string(&comment_notification(11)).unwrap();
    assert_eq!(broker.state.notify_user("alice", &body).await, 1);

    let received = next(&mut rx).await;
    assert_eq!(received.id, 11);
    assert_eq!(received.kind, NotificationType::TaskNewComment);
    assert_eq!(received.param("task_description"), "Call back");
}

#[tokio::test]
async fn notify_endpoint_routes_only_to_target_user() {
    let broker = Broker::start().await;
    let alice = broker.session("tok-alice", "alice");
    let bob = broker.session("tok-bob", "bob");
    let mut alice_rx = connect_collecting(&alice).await;
    let mut bob_rx = connect_collecting(&bob).await;
    broker.wait_for_feeds(2).await;

    let response: NotifyResponse = reqwest::Client::new()
        .post(format!("http://{}/notify/bob", broker.addr))
        .json(&comment_notification(21))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response.delivered, 1);

    assert_eq!(next(&mut bob_rx).await.id, 21);
    let nothing = tokio::time::timeout(Duration::from_millis(200), alice_rx.recv()).await;
    assert!(nothing.is_err(), "alice must not receive bob's notification");
}

#[tokio::test]
async fn malformed_push_is_dropped_and_feed_stays_live() {
    let broker = Broker::start().await;
    let session = broker.session("tok-alice", "alice");
    let mut rx = connect_collecting(&session).await;
    broker.wait_for_feeds(1).await;

    broker.state.notify_user("alice", r#"{"id":"not a number"}"#).await;
    let body = serde_json::to_string(&comment_notification(31)).unwrap();
    broker.state.notify_user("alice", &body).await;

    assert_eq!(next(&mut rx).await.id, 31);
    assert!(session.is_connected());
}

#[tokio::test]
async fn bad_token_fails_and_stays_disconnected() {
    let broker = Broker::start().await;
    let session = broker.session("wrong", "alice");

    let result = session.connect(|_| {}).await;
    assert!(matches!(result, Err(SessionError::Connection(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.registry().is_empty());
}

#[tokio::test]
async fn second_connect_is_noop() {
    let broker = Broker::start().await;
    let session = broker.session("tok-alice", "alice");
    let _rx = connect_collecting(&session).await;
    broker.wait_for_feeds(1).await;

    session.connect(|_| {}).await.unwrap();

    assert_eq!(broker.state.connection_count().await, 1);
    assert_eq!(session.registry().len(), 1);
}

#[tokio::test]
async fn broker_close_clears_registry_and_reconnect_works() {
    let broker = Broker::start().await;
    let session = broker.session("tok-alice", "alice");
    let _rx = connect_collecting(&session).await;
    session.subscribe(Topic::TaskChat(4), |_| {}).unwrap();
    broker.wait_for_feeds(1).await;

    let mut state = session.watch_state();
    broker.state.close_all_connections().await;
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .expect("session never noticed the close")
    .unwrap();
    assert!(session.registry().is_empty());

    let mut rx = connect_collecting(&session).await;
    assert!(session.is_connected());
    broker.wait_for_feeds(1).await;
    let body = serde_json::to_string(&comment_notification(41)).unwrap();
    broker.state.notify_user("alice", &body).await;
    assert_eq!(next(&mut rx).await.id, 41);
}

#[tokio::test]
async fn operations_after_disconnect_fail() {
    let broker = Broker::start().await;
    let session = broker.session("tok-alice", "alice");
    let _rx = connect_collecting(&session).await;

    session.disconnect().await;
    session.disconnect().await;

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(matches!(
        session.publish(&Topic::TaskChat(1), &"hi"),
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(
        session.subscribe(Topic::TaskChat(1), |_| {}),
        Err(SessionError::NotConnected)
    ));
    broker.wait_for_feeds(0).await;
}
