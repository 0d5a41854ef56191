// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for the task board against a mocked REST API.
//!
//! These tests validate:
//! - `refresh` partitions the client's tasks into the three columns
//! - Filters combine search, contact and deadline criteria
//! - A move is visible before the status request completes
//! - A failed move is kept or reverted depending on the policy
//! - Drops on unknown or identical columns send nothing
//! - Created tasks land in the column they were created in

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use crmsync::api::rest::RestClient;
use crmsync::board::{BoardFilter, BoardReconciler, DeadlineFilter};
use crmsync::credentials::Credentials;
use crmsync::policy::PolicyKind;
use crmsync_proto::task::{TaskDraft, TaskStatus};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLIENT: i64 = 3;

fn task_json(id: i64, description: &str, status: &str, due: Option<&str>) -> serde_json::Value {
    json!({
        "id": id,
        "description": description,
        "status": status,
        "dueDate": due,
        "client": {"id": CLIENT, "companyName": "Acme"},
    })
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
}

async fn api_with_tasks() -> MockServer {
    let server = MockServer::start().await;
    let mut assigned = task_json(2, "Send invoice", "TODO", Some("2024-07-01"));
    assigned["contact"] = json!({"id": 8, "firstName": "Jane", "lastName": "Doe"});
    Mock::given(method("GET"))
        .and(path(format!("/task/client/{CLIENT}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            task_json(1, "Call back", "TODO", Some("2024-06-01")),
            assigned,
            task_json(3, "Renew contract", "IN_PROGRESS", None),
            task_json(4, "Old overdue but done", "DONE", Some("2024-01-01")),
        ])))
        .mount(&server)
        .await;
    server
}

fn board_for(server: &MockServer, policy: PolicyKind) -> BoardReconciler<RestClient> {
    let rest = RestClient::new(
        &Url::parse(&server.uri()).unwrap(),
        Credentials::with_login("secret", "alice"),
        Duration::from_secs(5),
    )
    .unwrap();
    BoardReconciler::new(Arc::new(rest), CLIENT, policy.build())
}

fn column_ids(board: &BoardReconciler<RestClient>, status: TaskStatus) -> Vec<i64> {
    board
        .snapshot()
        .column(status)
        .iter()
        .map(|t| t.id)
        .collect()
}

#[tokio::test]
async fn refresh_partitions_by_status() {
    let server = api_with_tasks().await;
    let board = board_for(&server, PolicyKind::KeepOptimistic);

    assert_eq!(board.refresh().await.unwrap(), 4);
    assert_eq!(column_ids(&board, TaskStatus::Todo), vec![1, 2]);
    assert_eq!(column_ids(&board, TaskStatus::InProgress), vec![3]);
    assert_eq!(column_ids(&board, TaskStatus::Done), vec![4]);
}

#[tokio::test]
async fn filters_combine() {
    let server = api_with_tasks().await;
    let board = board_for(&server, PolicyKind::KeepOptimistic);
    board.refresh().await.unwrap();

    let overdue = board.view(
        &BoardFilter {
            deadline: Some(DeadlineFilter::Overdue),
            ..Default::default()
        },
        today(),
    );
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue.column(TaskStatus::Todo)[0].id, 1);

    let jane = board.view(
        &BoardFilter {
            search: Some("INVOICE".into()),
            contact_id: Some(8),
            deadline: Some(DeadlineFilter::NotOverdue),
        },
        today(),
    );
    assert_eq!(jane.len(), 1);
    assert_eq!(jane.column(TaskStatus::Todo)[0].id, 2);

    let none = board.view(
        &BoardFilter {
            search: Some("invoice".into()),
            contact_id: Some(99),
            deadline: None,
        },
        today(),
    );
    assert!(none.is_empty());
}

#[tokio::test]
async fn move_is_local_first_then_confirmed() {
    let server = api_with_tasks().await;
    Mock::given(method("PATCH"))
        .and(path("/task/status/1"))
        .and(query_param("status", "DONE"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(task_json(1, "Call back", "DONE", Some("2024-06-01")))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let board = board_for(&server, PolicyKind::RevertOnFailure);
    board.refresh().await.unwrap();

    let confirmation = board
        .move_task(1, TaskStatus::Todo, TaskStatus::Done)
        .unwrap();
    assert_eq!(board.snapshot().status_of(1), Some(TaskStatus::Done));
    assert_eq!(column_ids(&board, TaskStatus::Done), vec![4, 1]);

    confirmation.await.unwrap();
    assert_eq!(board.snapshot().status_of(1), Some(TaskStatus::Done));
}

#[tokio::test]
async fn failed_move_is_kept_by_default() {
    let server = api_with_tasks().await;
    Mock::given(method("PATCH"))
        .and(path("/task/status/3"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "db down"})))
        .mount(&server)
        .await;
    let board = board_for(&server, PolicyKind::KeepOptimistic);
    board.refresh().await.unwrap();

    board
        .handle_drop(3, Some("DONE"))
        .expect("drop should move the task")
        .await
        .unwrap();

    assert_eq!(board.snapshot().status_of(3), Some(TaskStatus::Done));
}

#[tokio::test]
async fn failed_move_is_reverted_when_configured() {
    let server = api_with_tasks().await;
    Mock::given(method("PATCH"))
        .and(path("/task/status/3"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let board = board_for(&server, PolicyKind::RevertOnFailure);
    board.refresh().await.unwrap();

    board
        .handle_drop(3, Some("DONE"))
        .expect("drop should move the task")
        .await
        .unwrap();

    assert_eq!(board.snapshot().status_of(3), Some(TaskStatus::InProgress));
    assert_eq!(column_ids(&board, TaskStatus::Done), vec![4]);
}

#[tokio::test]
async fn pointless_drops_send_nothing() {
    let server = api_with_tasks().await;
    let board = board_for(&server, PolicyKind::KeepOptimistic);
    board.refresh().await.unwrap();

    assert!(board.handle_drop(1, None).is_none());
    assert!(board.handle_drop(1, Some("ARCHIVE")).is_none());
    assert!(board.handle_drop(1, Some("TODO")).is_none());
    assert!(board.handle_drop(42, Some("DONE")).is_none());

    let patches = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "PATCH")
        .count();
    assert_eq!(patches, 0);
    assert_eq!(column_ids(&board, TaskStatus::Todo), vec![1, 2]);
}

#[tokio::test]
async fn created_task_lands_in_its_column() {
    let server = api_with_tasks().await;
    Mock::given(method("POST"))
        .and(path("/task"))
        .and(body_partial_json(json!({
            "description": "Prepare demo",
            "status": "IN_PROGRESS",
            "client": {"id": CLIENT},
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(task_json(9, "Prepare demo", "IN_PROGRESS", None)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let board = board_for(&server, PolicyKind::KeepOptimistic);
    board.refresh().await.unwrap();

    let created = board
        .create_in_column(TaskStatus::InProgress, TaskDraft::new(CLIENT, "Prepare demo"))
        .await
        .unwrap();

    assert_eq!(created.id, 9);
    assert_eq!(column_ids(&board, TaskStatus::InProgress), vec![3, 9]);
}

#[tokio::test]
async fn failed_refresh_keeps_board() {
    let server = api_with_tasks().await;
    let board = board_for(&server, PolicyKind::KeepOptimistic);
    board.refresh().await.unwrap();
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    assert!(board.refresh().await.is_err());
    assert_eq!(board.snapshot().len(), 4);
}
