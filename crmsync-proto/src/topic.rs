//! Logical topics carried over the persistent connection.
//!
//! A [`Topic`] is the client-side identity of a channel: the user's
//! notification feed, or the chat channel of one task. Each topic maps to a
//! canonical broker destination string via [`Topic::destination`].

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Destination of the per-user notification queue.
///
/// The broker resolves `/user/...` destinations against the authenticated
/// user of the connection, so the string carries no user identifier.
pub const USER_NOTIFICATION_DESTINATION: &str = "/user/queue/notification";

/// Prefix shared by all per-task chat destinations.
pub const TASK_CHAT_PREFIX: &str = "/topic/tasks/";

/// Suffix shared by all per-task chat destinations.
pub const TASK_CHAT_SUFFIX: &str = "/chat";

/// A logical channel on the persistent connection.
///
/// Identity is the `(kind, id)` tuple: two `TaskChat` topics for the same
/// task are the same topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// The notification feed of one user (exactly one per session).
    UserNotificationFeed(String),
    /// The chat channel of one task.
    TaskChat(i64),
}

impl Topic {
    /// Returns the broker destination this topic subscribes to.
    #[must_use]
    pub fn destination(&self) -> String {
        match self {
            Self::UserNotificationFeed(_) => USER_NOTIFICATION_DESTINATION.to_string(),
            Self::TaskChat(task_id) => format!("{TASK_CHAT_PREFIX}{task_id}{TASK_CHAT_SUFFIX}"),
        }
    }

    /// Parses a per-task chat destination back into its task id.
    ///
    /// Returns `None` for anything that is not `/topic/tasks/{id}/chat`.
    #[must_use]
    pub fn task_chat_id(destination: &str) -> Option<i64> {
        destination
            .strip_prefix(TASK_CHAT_PREFIX)?
            .strip_suffix(TASK_CHAT_SUFFIX)?
            .parse()
            .ok()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserNotificationFeed(user) => write!(f, "notifications({user})"),
            Self::TaskChat(task_id) => write!(f, "task-chat({task_id})"),
        }
    }
}

/// Wire identifier of one subscription on one connection.
///
/// Generated by the client when it subscribes; the server echoes it on every
/// delivery so the client can route without parsing destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Creates a new time-ordered subscription identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `SubscriptionId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
