//! Task resource types shared by the board and the REST client.
//!
//! Field names follow the REST payloads (camelCase). Due dates are plain
//! calendar dates without a time zone.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Workflow status of a task. Each status is one board column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Not started.
    Todo,
    /// Being worked on.
    InProgress,
    /// Finished. Done tasks are never overdue.
    Done,
}

impl TaskStatus {
    /// All statuses in board column order.
    pub const ALL: [Self; 3] = [Self::Todo, Self::InProgress, Self::Done];

    /// Returns the wire name (`TODO`, `IN_PROGRESS`, `DONE`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "TODO",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
        }
    }

    /// Resolves a board column identifier (the wire name) into a status.
    ///
    /// Returns `None` for anything that is not a known column.
    #[must_use]
    pub fn from_column_id(column: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == column)
    }

    /// Human-readable column title.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Todo => "To do",
            Self::InProgress => "In progress",
            Self::Done => "Done",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the client a task belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRef {
    /// Client identifier.
    pub id: i64,
    /// Display name, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

/// Reference to the contact assigned to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRef {
    /// Contact identifier.
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl ContactRef {
    /// Returns `"First Last"`, trimmed.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// A task as returned by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Server-assigned identifier.
    pub id: i64,
    pub description: String,
    pub status: TaskStatus,
    /// Due date, if any. Tasks without one are never overdue.
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub client: ClientRef,
    #[serde(default)]
    pub contact: Option<ContactRef>,
}

impl Task {
    /// Returns `true` if the task is past due on `today` and not done.
    #[must_use]
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status != TaskStatus::Done && self.due_date.is_some_and(|due| due < today)
    }

    /// Returns the assigned contact id, if any.
    #[must_use]
    pub fn contact_id(&self) -> Option<i64> {
        self.contact.as_ref().map(|c| c.id)
    }
}

/// Payload for creating a task. The server assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub client: ClientRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactRef>,
}

impl TaskDraft {
    /// Creates a draft for `client_id` with the given description.
    ///
    /// The status defaults to [`TaskStatus::Todo`]; the board overrides it
    /// with the column the task is created in.
    #[must_use]
    pub fn new(client_id: i64, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: TaskStatus::Todo,
            due_date: None,
            client: ClientRef {
                id: client_id,
                company_name: None,
            },
            contact: None,
        }
    }
}
