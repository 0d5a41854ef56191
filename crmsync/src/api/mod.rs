//! REST collaborator interfaces.
//!
//! The reconcilers only see these narrow traits; [`rest::RestClient`] is the
//! HTTP implementation, and tests substitute in-memory fakes.

pub mod rest;

use crmsync_proto::comment::{ChatMessage, CommentDraft};
use crmsync_proto::notification::Notification;
use crmsync_proto::task::{Task, TaskDraft, TaskStatus};

/// Errors from REST calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response (connect, timeout, TLS).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server-provided reason, or the canonical reason phrase.
        message: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// No bearer token is stored.
    #[error("no credentials stored")]
    MissingCredentials,

    /// The API base URL cannot have path segments appended.
    #[error("invalid API base URL: {0}")]
    InvalidBaseUrl(String),
}

/// Task endpoints used by the board.
pub trait TaskApi: Send + Sync + 'static {
    /// `GET /task/client/{client_id}`.
    fn fetch_tasks_by_client(
        &self,
        client_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<Task>, ApiError>> + Send;

    /// `PATCH /task/status/{task_id}?status=S`.
    fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
    ) -> impl std::future::Future<Output = Result<Task, ApiError>> + Send;

    /// `POST /task`.
    fn create_task(
        &self,
        draft: &TaskDraft,
    ) -> impl std::future::Future<Output = Result<Task, ApiError>> + Send;
}

/// Notification endpoints used by the notification feed.
pub trait NotificationApi: Send + Sync + 'static {
    /// `GET /notifications/{username}`.
    fn fetch_notifications(
        &self,
        username: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Notification>, ApiError>> + Send;

    /// `PUT /notifications/{id}` with the notification marked viewed.
    fn mark_viewed(
        &self,
        notification: &Notification,
    ) -> impl std::future::Future<Output = Result<Notification, ApiError>> + Send;

    /// `PATCH /notifications/{id}`.
    fn dismiss(
        &self,
        notification_id: i64,
    ) -> impl std::future::Future<Output = Result<Notification, ApiError>> + Send;
}

/// Comment endpoints used by task chat.
pub trait CommentApi: Send + Sync + 'static {
    /// `GET /comments/{task_id}`.
    fn fetch_comments(
        &self,
        task_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<ChatMessage>, ApiError>> + Send;

    /// `POST /comments/{task_id}`.
    fn add_comment(
        &self,
        task_id: i64,
        draft: &CommentDraft,
    ) -> impl std::future::Future<Output = Result<ChatMessage, ApiError>> + Send;
}
