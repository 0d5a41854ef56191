// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for task chat over a real broker and a mocked REST API.
//!
//! These tests validate:
//! - History is seeded before live messages
//! - Messages sent one after another arrive in send order at every follower,
//!   the sender included (publish-back, no local echo)
//! - A message already present from history is not appended twice
//! - Closing the stream releases the broker subscription
//! - Opening the same task twice on one session is refused

use std::sync::Arc;
use std::time::Duration;

use crmsync::api::rest::{DEFAULT_REQUEST_TIMEOUT, RestClient};
use crmsync::chat::{ChatError, ChatStream, DedupPolicy};
use crmsync::credentials::Credentials;
use crmsync::session::Session;
use crmsync::transport::ws::WsConnector;
use crmsync_broker::auth::TokenTable;
use crmsync_broker::broker::{BrokerState, start_server_with_state};
use crmsync_proto::comment::ChatMessage;
use crmsync_proto::topic::Topic;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TASK: i64 = 9;
const CHAT_DESTINATION: &str = "/topic/tasks/9/chat";

fn message_json(id: i64, content: &str, username: &str) -> serde_json::Value {
    json!({
        "id": id,
        "content": content,
        "username": username,
        "sentAt": format!("2024-05-01T10:00:{:02}", id % 60),
    })
}

struct Harness {
    state: Arc<BrokerState>,
    ws_url: Url,
    api: MockServer,
    _broker: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        let tokens = TokenTable::from_pairs([("tok-alice", "alice"), ("tok-bob", "bob")]);
        let state = Arc::new(BrokerState::new(tokens));
        let (addr, handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .unwrap();
        let api = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/comments/{TASK}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([message_json(100, "hello", "bob")])),
            )
            .mount(&api)
            .await;
        Self {
            state,
            ws_url: Url::parse(&format!("ws://{addr}/ws")).unwrap(),
            api,
            _broker: handle,
        }
    }

    async fn login(&self, token: &str, username: &str) -> (Session<WsConnector>, RestClient) {
        let credentials = Credentials::with_login(token, username);
        let session = Session::new(WsConnector::new(self.ws_url.clone()), credentials.clone());
        session.connect(|_| {}).await.unwrap();
        let rest = RestClient::new(
            &Url::parse(&self.api.uri()).unwrap(),
            credentials,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .unwrap();
        (session, rest)
    }

    async fn wait_for_chat_subscribers(&self, n: usize) {
        for _ in 0..200 {
            if self.state.subscriber_count(CHAT_DESTINATION).await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("broker never saw {n} chat subscriptions");
    }
}

async fn wait_for_len<C, A>(stream: &ChatStream<'_, C, A>, len: usize)
where
    C: crmsync::transport::Connector,
    A: crmsync::api::CommentApi,
{
    let mut changes = stream.changes();
    tokio::time::timeout(Duration::from_secs(2), changes.wait_for(|n| *n >= len))
        .await
        .expect("chat log never reached expected length")
        .unwrap();
}

fn ids(messages: &[ChatMessage]) -> Vec<i64> {
    messages.iter().map(|m| m.id).collect()
}

#[tokio::test]
async fn sent_messages_arrive_in_order_at_every_follower() {
    let harness = Harness::start().await;
    for (id, content) in [(101, "one"), (102, "two")] {
        Mock::given(method("POST"))
            .and(path(format!("/comments/{TASK}")))
            .and(body_partial_json(json!({"content": content, "username": "alice"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(message_json(id, content, "alice")))
            .expect(1)
            .mount(&harness.api)
            .await;
    }

    let (alice, alice_api) = harness.login("tok-alice", "alice").await;
    let (bob, bob_api) = harness.login("tok-bob", "bob").await;
    let alice_chat = ChatStream::open(&alice, &alice_api, TASK, DedupPolicy::ById)
        .await
        .unwrap();
    let bob_chat = ChatStream::open(&bob, &bob_api, TASK, DedupPolicy::ById)
        .await
        .unwrap();
    assert_eq!(ids(&alice_chat.messages()), vec![100]);
    harness.wait_for_chat_subscribers(2).await;

    let first = alice_chat.send("one").await.unwrap();
    let second = alice_chat.send("two").await.unwrap();
    assert_eq!((first.id, second.id), (101, 102));

    wait_for_len(&bob_chat, 3).await;
    wait_for_len(&alice_chat, 3).await;
    assert_eq!(ids(&bob_chat.messages()), vec![100, 101, 102]);
    assert_eq!(ids(&alice_chat.messages()), vec![100, 101, 102]);
    assert_eq!(bob_chat.messages()[2].content, "two");
}

#[tokio::test]
async fn history_message_pushed_again_is_not_duplicated() {
    let harness = Harness::start().await;
    let (alice, alice_api) = harness.login("tok-alice", "alice").await;
    let (bob, _) = harness.login("tok-bob", "bob").await;

    let chat = ChatStream::open(&alice, &alice_api, TASK, DedupPolicy::ById)
        .await
        .unwrap();
    harness.wait_for_chat_subscribers(1).await;

    let replayed: ChatMessage = serde_json::from_value(message_json(100, "hello", "bob")).unwrap();
    let fresh: ChatMessage = serde_json::from_value(message_json(103, "new", "bob")).unwrap();
    bob.publish(&Topic::TaskChat(TASK), &replayed).unwrap();
    bob.publish(&Topic::TaskChat(TASK), &fresh).unwrap();

    wait_for_len(&chat, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ids(&chat.messages()), vec![100, 103]);
}

#[tokio::test]
async fn blank_message_is_not_sent() {
    let harness = Harness::start().await;
    let (alice, alice_api) = harness.login("tok-alice", "alice").await;
    let chat = ChatStream::open(&alice, &alice_api, TASK, DedupPolicy::ById)
        .await
        .unwrap();

    assert!(matches!(chat.send("   ").await, Err(ChatError::EmptyContent)));
    let posts = harness
        .api
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST")
        .count();
    assert_eq!(posts, 0);
}

#[tokio::test]
async fn close_releases_broker_subscription() {
    let harness = Harness::start().await;
    let (alice, alice_api) = harness.login("tok-alice", "alice").await;
    let chat = ChatStream::open(&alice, &alice_api, TASK, DedupPolicy::ById)
        .await
        .unwrap();
    harness.wait_for_chat_subscribers(1).await;

    chat.close();

    harness.wait_for_chat_subscribers(0).await;
    assert!(!alice.registry().contains(&Topic::TaskChat(TASK)));
    assert!(alice.is_connected());
}

#[tokio::test]
async fn second_open_on_same_task_is_refused() {
    let harness = Harness::start().await;
    let (alice, alice_api) = harness.login("tok-alice", "alice").await;
    let _chat = ChatStream::open(&alice, &alice_api, TASK, DedupPolicy::ById)
        .await
        .unwrap();

    let again = ChatStream::open(&alice, &alice_api, TASK, DedupPolicy::ById).await;
    assert!(matches!(again, Err(ChatError::AlreadyOpen(TASK))));
    assert!(alice.registry().contains(&Topic::TaskChat(TASK)));
}
