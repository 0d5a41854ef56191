// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for the notification feed: REST listing and
//! confirmations against a mocked API, live pushes through a real broker.
//!
//! These tests validate:
//! - The initial listing and live pushes share one collection and badge
//! - Rendered texts follow the notification type
//! - Mark-all-viewed and dismiss apply locally and confirm per notification
//! - Failed confirmations never move a notification backwards
//! - A failed listing leaves the collection untouched

use std::sync::Arc;
use std::time::Duration;

use crmsync::api::rest::RestClient;
use crmsync::credentials::Credentials;
use crmsync::notifications::{FALLBACK_TEXT, NotificationReconciler, NotificationState};
use crmsync::policy::PolicyKind;
use crmsync::session::Session;
use crmsync::transport::ws::WsConnector;
use crmsync_broker::auth::TokenTable;
use crmsync_broker::broker::{BrokerState, start_server_with_state};
use crmsync_proto::topic::USER_NOTIFICATION_DESTINATION;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn listing() -> serde_json::Value {
    json!([
        {
            "id": 1,
            "type": "TASK_STATUS_CHANGED",
            "sentAt": "2024-06-01 09:00",
            "viewed": false,
            "dismissed": false,
            "params": {"task_description": "Call back", "task_status": "DONE"}
        },
        {
            "id": 2,
            "type": "TASK_DUE_DATE",
            "viewed": true,
            "dismissed": false,
            "params": {"task_description": "Send invoice", "task_due_date": "2024-07-01"}
        },
        {
            "id": 3,
            "type": "TASK_NEW_COMMENT",
            "viewed": true,
            "dismissed": true,
            "params": {"task_description": "Old"}
        }
    ])
}

async fn api() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notifications/alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing()))
        .mount(&server)
        .await;
    server
}

fn reconciler(server: &MockServer, policy: PolicyKind) -> NotificationReconciler<RestClient> {
    let rest = RestClient::new(
        &Url::parse(&server.uri()).unwrap(),
        Credentials::with_login("secret", "alice"),
        Duration::from_secs(5),
    )
    .unwrap();
    NotificationReconciler::new(Arc::new(rest), policy.build())
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn listing_is_rendered_and_counted() {
    let server = api().await;
    let feed = reconciler(&server, PolicyKind::KeepOptimistic);

    assert_eq!(feed.load_initial("alice").await.unwrap(), 3);
    assert_eq!(feed.badge_count(), 1);

    let visible = feed.visible();
    assert_eq!(visible.len(), 2);
    assert_eq!(
        visible[0].text,
        "Task \"Call back\" status has been changed to \"DONE\"."
    );
    assert_eq!(visible[0].sent_at.as_deref(), Some("2024-06-01 09:00"));
    assert_eq!(
        visible[1].text,
        "Task \"Send invoice\" has a new due date: 2024-07-01."
    );
    assert_eq!(visible[1].state, NotificationState::Viewed);
}

#[tokio::test]
async fn live_pushes_join_the_listing() {
    let server = api().await;
    let feed = reconciler(&server, PolicyKind::KeepOptimistic);
    feed.load_initial("alice").await.unwrap();

    let tokens = TokenTable::from_pairs([("secret", "alice")]);
    let state = Arc::new(BrokerState::new(tokens));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    let session = Session::new(
        WsConnector::new(Url::parse(&format!("ws://{addr}/ws")).unwrap()),
        Credentials::with_login("secret", "alice"),
    );
    session.connect(feed.handler()).await.unwrap();
    for _ in 0..200 {
        if state.subscriber_count(USER_NOTIFICATION_DESTINATION).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let pushes = [
        json!({"id": 4, "type": "TASK_NEW_COMMENT", "params": {"task_description": "Call back"}}),
        json!({"id": 5, "type": "CLIENT_MERGED", "params": {}}),
        json!({"id": 1, "type": "TASK_STATUS_CHANGED", "params": {}}),
    ];
    for push in &pushes {
        state.notify_user("alice", &push.to_string()).await;
    }

    for _ in 0..200 {
        if feed.snapshot().len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = feed.snapshot();
    assert_eq!(snapshot.len(), 5);
    assert_eq!(feed.badge_count(), 3);
    let visible = feed.visible();
    let ids: Vec<i64> = visible.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![1, 2, 4, 5]);
    assert_eq!(visible[2].text, "New comment on task \"Call back\".");
    assert_eq!(visible[3].text, FALLBACK_TEXT);
}

#[tokio::test]
async fn mark_all_viewed_confirms_each_unseen() {
    let server = api().await;
    Mock::given(method("PUT"))
        .and(path("/notifications/1"))
        .and(body_partial_json(json!({"id": 1, "viewed": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1, "type": "TASK_STATUS_CHANGED", "viewed": true
        })))
        .expect(1)
        .mount(&server)
        .await;
    let feed = reconciler(&server, PolicyKind::KeepOptimistic);
    feed.load_initial("alice").await.unwrap();

    let confirmations = feed.mark_all_unseen_as_viewed();
    assert_eq!(confirmations.len(), 1);
    assert_eq!(feed.badge_count(), 0);
    join_all(confirmations).await;

    assert!(feed.mark_all_unseen_as_viewed().is_empty());
}

#[tokio::test]
async fn failed_viewed_confirmation_is_not_reverted() {
    let server = api().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let feed = reconciler(&server, PolicyKind::RevertOnFailure);
    feed.load_initial("alice").await.unwrap();

    join_all(feed.mark_all_unseen_as_viewed()).await;

    assert_eq!(feed.badge_count(), 0);
    assert_eq!(feed.snapshot().state(1), Some(NotificationState::Viewed));
}

#[tokio::test]
async fn dismiss_is_terminal_and_sent_once() {
    let server = api().await;
    Mock::given(method("PATCH"))
        .and(path("/notifications/2"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    let feed = reconciler(&server, PolicyKind::RevertOnFailure);
    feed.load_initial("alice").await.unwrap();

    feed.dismiss(2).expect("first dismiss").await.unwrap();

    assert_eq!(feed.snapshot().state(2), Some(NotificationState::Dismissed));
    assert!(feed.visible().iter().all(|v| v.id != 2));
    assert!(feed.dismiss(2).is_none());
    assert!(feed.dismiss(3).is_none());
    assert!(feed.dismiss(99).is_none());
}

#[tokio::test]
async fn failed_listing_keeps_collection() {
    let server = api().await;
    let feed = reconciler(&server, PolicyKind::KeepOptimistic);
    feed.load_initial("alice").await.unwrap();

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .mount(&server)
        .await;

    let err = feed.load_initial("alice").await.unwrap_err();
    assert!(err.to_string().contains("401") || err.to_string().contains("token expired"));
    assert_eq!(feed.snapshot().len(), 3);
}
