//! Task chat messages.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One persisted chat message on a task.
///
/// Also the payload published on `/topic/tasks/{id}/chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub content: String,
    pub username: String,
    pub sent_at: NaiveDateTime,
}

/// Body of `POST /comments/{taskId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentDraft {
    pub content: String,
    pub username: String,
}
