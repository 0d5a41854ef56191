//! Per-task chat streams.
//!
//! A [`ChatStream`] seeds its log from the REST history, then follows the
//! task's chat topic. Sending posts the comment and publishes the saved copy
//! on the topic; the sender sees its own message when the broker delivers
//! it back, like everyone else. Messages are kept in receipt order.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use crmsync_proto::comment::{ChatMessage, CommentDraft};
use crmsync_proto::topic::{SubscriptionId, Topic};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::api::{ApiError, CommentApi};
use crate::registry::Acquired;
use crate::session::{Session, SessionError};
use crate::transport::Connector;

/// Errors from chat operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Blank messages are not sent.
    #[error("message is empty")]
    EmptyContent,

    /// Another stream already follows this task's chat.
    #[error("chat for task {0} is already open")]
    AlreadyOpen(i64),

    /// No username is stored.
    #[error("no credentials stored")]
    MissingCredentials,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// How pushes that repeat a logged message id are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    /// Drop a push whose id is already in the log.
    #[default]
    ById,
    /// Append everything.
    Off,
}

/// Append-only message log.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
    ids: HashSet<i64>,
    dedup: DedupPolicy,
}

impl ChatLog {
    #[must_use]
    pub fn new(dedup: DedupPolicy) -> Self {
        Self {
            dedup,
            ..Self::default()
        }
    }

    /// Append a message. Returns `false` if the dedup policy dropped it.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        let fresh = self.ids.insert(message.id);
        if !fresh && self.dedup == DedupPolicy::ById {
            return false;
        }
        self.messages.push(message);
        true
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Live chat of one task.
///
/// Borrows the session; the topic is released on [`ChatStream::close`] or
/// drop, but only while the registry still holds the subscription this
/// stream created. Pushes that arrive after that are discarded.
pub struct ChatStream<'a, C: Connector, A: CommentApi> {
    session: &'a Session<C>,
    api: &'a A,
    task_id: i64,
    subscription: SubscriptionId,
    log: Arc<Mutex<ChatLog>>,
    changes: watch::Receiver<usize>,
    open: bool,
}

impl<'a, C: Connector, A: CommentApi> ChatStream<'a, C, A> {
    /// Fetch the history of `task_id`, then follow its chat topic.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Api`] if the history fetch fails.
    /// - [`ChatError::Session`] if the topic cannot be subscribed.
    /// - [`ChatError::AlreadyOpen`] if the topic is already subscribed.
    pub async fn open(
        session: &'a Session<C>,
        api: &'a A,
        task_id: i64,
        dedup: DedupPolicy,
    ) -> Result<Self, ChatError> {
        let history = api.fetch_comments(task_id).await?;
        let mut log = ChatLog::new(dedup);
        for message in history {
            log.append(message);
        }
        let seeded = log.len();
        let log = Arc::new(Mutex::new(log));
        let (changed, changes) = watch::channel(seeded);

        let weak: Weak<Mutex<ChatLog>> = Arc::downgrade(&log);
        let acquired = session.subscribe_json(Topic::TaskChat(task_id), move |message: ChatMessage| {
            let Some(log) = weak.upgrade() else {
                return;
            };
            let id = message.id;
            let len = {
                let mut log = log.lock();
                if !log.append(message) {
                    debug!(task_id, message_id = id, "duplicate chat message dropped");
                    return;
                }
                log.len()
            };
            changed.send_replace(len);
        })?;
        let Acquired::Created(subscription) = acquired else {
            return Err(ChatError::AlreadyOpen(task_id));
        };

        info!(task_id, history = seeded, "chat opened");
        Ok(Self {
            session,
            api,
            task_id,
            subscription,
            log,
            changes,
            open: true,
        })
    }

    #[must_use]
    pub const fn task_id(&self) -> i64 {
        self.task_id
    }

    /// Copy of the log in receipt order.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.log.lock().messages().to_vec()
    }

    /// Receiver notified with the new log length after every append.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<usize> {
        self.changes.clone()
    }

    /// Post a message and publish the saved copy on the chat topic.
    ///
    /// Nothing is appended locally; the message shows up when the broker
    /// delivers it back.
    ///
    /// # Errors
    ///
    /// - [`ChatError::EmptyContent`] for blank content; nothing is sent.
    /// - [`ChatError::MissingCredentials`] if no username is stored.
    /// - [`ChatError::Api`] if the post fails; nothing is published.
    /// - [`ChatError::Session`] if publishing fails.
    pub async fn send(&self, content: &str) -> Result<ChatMessage, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let username = self
            .session
            .credentials()
            .username()
            .ok_or(ChatError::MissingCredentials)?;
        let draft = CommentDraft {
            content: content.to_string(),
            username,
        };
        let saved = self.api.add_comment(self.task_id, &draft).await?;
        self.session.publish(&Topic::TaskChat(self.task_id), &saved)?;
        debug!(task_id = self.task_id, message_id = saved.id, "chat message sent");
        Ok(saved)
    }

    /// Stop following the topic.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.open) {
            return;
        }
        let topic = Topic::TaskChat(self.task_id);
        // A reconnect may have handed the topic to a newer stream.
        if self.session.registry().id_of(&topic) == Some(self.subscription) {
            self.session.unsubscribe(&topic);
        }
        debug!(task_id = self.task_id, "chat closed");
    }
}

impl<C: Connector, A: CommentApi> Drop for ChatStream<'_, C, A> {
    fn drop(&mut self) {
        self.release();
    }
}
