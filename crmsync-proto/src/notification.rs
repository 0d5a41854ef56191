//! Notification resource and push payload.
//!
//! The same JSON shape is used for REST responses and for pushes on the
//! user notification queue. Unknown notification types decode as
//! [`NotificationType::Unknown`] instead of failing the whole payload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Kind of event a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    /// A task moved to another status. Params: `task_description`, `task_status`.
    TaskStatusChanged,
    /// Someone commented on a task. Params: `task_description`.
    TaskNewComment,
    /// A task's due date changed. Params: `task_description`, `task_due_date`.
    TaskDueDate,
    /// Any type this client does not know.
    #[serde(other)]
    Unknown,
}

/// A notification addressed to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    /// Server timestamp, kept as the server formatted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(default)]
    pub viewed: bool,
    #[serde(default)]
    pub dismissed: bool,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl Notification {
    /// Creates an unseen notification with no parameters.
    #[must_use]
    pub fn new(id: i64, kind: NotificationType) -> Self {
        Self {
            id,
            kind,
            sent_at: None,
            viewed: false,
            dismissed: false,
            params: HashMap::new(),
        }
    }

    /// Adds a render parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns a parameter value, or the empty string if absent.
    #[must_use]
    pub fn param(&self, key: &str) -> &str {
        self.params.get(key).map_or("", String::as_str)
    }
}
