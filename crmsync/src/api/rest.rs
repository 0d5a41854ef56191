//! HTTP implementation of the REST collaborator traits.
//!
//! Every request carries `Authorization: Bearer <token>` read from the
//! shared [`Credentials`] at call time, so a re-login takes effect without
//! rebuilding the client.

use std::time::Duration;

use crmsync_proto::comment::{ChatMessage, CommentDraft};
use crmsync_proto::notification::Notification;
use crmsync_proto::task::{Task, TaskDraft, TaskStatus};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::{ApiError, CommentApi, NotificationApi, TaskApi};
use crate::credentials::Credentials;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Error body shapes the server uses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: Option<String>,
    exception_message: Option<String>,
}

/// REST client for the CRM resource API.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
}

impl RestClient {
    /// Build a client for `base_url`.
    ///
    /// # Errors
    ///
    /// - [`ApiError::InvalidBaseUrl`] if `base_url` cannot carry a path.
    /// - [`ApiError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &Url, credentials: Credentials, timeout: Duration) -> Result<Self, ApiError> {
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.clone(),
            credentials,
        })
    }

    /// Base URL requests are resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: Url,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let token = self
            .credentials
            .token()
            .ok_or(ApiError::MissingCredentials)?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let url = response.url().path().to_string();
        debug!(status = %status, path = %url, "response received");

        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(&body)
                    .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Extracts the server's reason from an error body.
fn error_message(body: &str) -> Option<String> {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.exception_message) {
            return Some(message);
        }
    }
    let trimmed = body.trim();
    (!trimmed.is_empty() && !trimmed.starts_with('{')).then(|| trimmed.to_string())
}

impl TaskApi for RestClient {
    async fn fetch_tasks_by_client(&self, client_id: i64) -> Result<Vec<Task>, ApiError> {
        let url = self.endpoint(&["task", "client", &client_id.to_string()]);
        let req = self.request(reqwest::Method::GET, url)?;
        self.execute(req).await
    }

    async fn update_task_status(&self, task_id: i64, status: TaskStatus) -> Result<Task, ApiError> {
        let mut url = self.endpoint(&["task", "status", &task_id.to_string()]);
        url.query_pairs_mut().append_pair("status", status.as_str());
        let req = self.request(reqwest::Method::PATCH, url)?;
        self.execute(req).await
    }

    async fn create_task(&self, draft: &TaskDraft) -> Result<Task, ApiError> {
        let req = self
            .request(reqwest::Method::POST, self.endpoint(&["task"]))?
            .json(draft);
        self.execute(req).await
    }
}

impl NotificationApi for RestClient {
    async fn fetch_notifications(&self, username: &str) -> Result<Vec<Notification>, ApiError> {
        let url = self.endpoint(&["notifications", username]);
        let req = self.request(reqwest::Method::GET, url)?;
        self.execute(req).await
    }

    async fn mark_viewed(&self, notification: &Notification) -> Result<Notification, ApiError> {
        let mut body = notification.clone();
        body.viewed = true;
        let url = self.endpoint(&["notifications", &notification.id.to_string()]);
        let req = self.request(reqwest::Method::PUT, url)?.json(&body);
        self.execute(req).await
    }

    async fn dismiss(&self, notification_id: i64) -> Result<Notification, ApiError> {
        let url = self.endpoint(&["notifications", &notification_id.to_string()]);
        let req = self.request(reqwest::Method::PATCH, url)?;
        self.execute(req).await
    }
}

impl CommentApi for RestClient {
    async fn fetch_comments(&self, task_id: i64) -> Result<Vec<ChatMessage>, ApiError> {
        let url = self.endpoint(&["comments", &task_id.to_string()]);
        let req = self.request(reqwest::Method::GET, url)?;
        self.execute(req).await
    }

    async fn add_comment(&self, task_id: i64, draft: &CommentDraft) -> Result<ChatMessage, ApiError> {
        let url = self.endpoint(&["comments", &task_id.to_string()]);
        let req = self.request(reqwest::Method::POST, url)?.json(draft);
        self.execute(req).await
    }
}
