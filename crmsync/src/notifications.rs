//! The user's notification feed and its optimistic reconciliation.
//!
//! Each notification is in one of three states derived from its flags:
//! `Dismissed` if dismissed, else `Viewed` if viewed, else `Unseen`.
//! Transitions only go forward (Unseen to Viewed to Dismissed, or straight
//! to Dismissed) and are applied locally before the confirming request.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use crmsync_proto::notification::{Notification, NotificationType};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{ApiError, NotificationApi};
use crate::policy::ReconcilePolicy;

/// Text shown for notification types this client cannot render.
pub const FALLBACK_TEXT: &str = "You have a new notification.";

/// Lifecycle state of one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationState {
    Unseen,
    Viewed,
    Dismissed,
}

impl NotificationState {
    /// Derive the state from the notification's flags.
    #[must_use]
    pub const fn of(notification: &Notification) -> Self {
        if notification.dismissed {
            Self::Dismissed
        } else if notification.viewed {
            Self::Viewed
        } else {
            Self::Unseen
        }
    }
}

impl fmt::Display for NotificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unseen => write!(f, "unseen"),
            Self::Viewed => write!(f, "viewed"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// Human-readable text for a notification.
#[must_use]
pub fn render_text(notification: &Notification) -> String {
    let description = notification.param("task_description");
    match notification.kind {
        NotificationType::TaskStatusChanged => format!(
            "Task \"{description}\" status has been changed to \"{}\".",
            notification.param("task_status")
        ),
        NotificationType::TaskNewComment => {
            format!("New comment on task \"{description}\".")
        }
        NotificationType::TaskDueDate => format!(
            "Task \"{description}\" has a new due date: {}.",
            notification.param("task_due_date")
        ),
        NotificationType::Unknown => FALLBACK_TEXT.to_string(),
    }
}

/// A notification as the feed shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleNotification {
    pub id: i64,
    pub state: NotificationState,
    pub text: String,
    pub sent_at: Option<String>,
}

/// Local notification collection in arrival order.
#[derive(Debug, Clone, Default)]
pub struct NotificationFeed {
    items: Vec<Notification>,
    ids: HashSet<i64>,
}

impl NotificationFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the collection with a server listing.
    pub fn load(&mut self, notifications: Vec<Notification>) {
        self.items.clear();
        self.ids.clear();
        for n in notifications {
            if self.ids.insert(n.id) {
                self.items.push(n);
            }
        }
    }

    /// Append a pushed notification as Unseen.
    ///
    /// Returns `false` if a notification with the same id is already present.
    pub fn receive_push(&mut self, mut notification: Notification) -> bool {
        if !self.ids.insert(notification.id) {
            return false;
        }
        notification.viewed = false;
        notification.dismissed = false;
        self.items.push(notification);
        true
    }

    /// Mark every Unseen notification Viewed.
    ///
    /// Returns the notifications that changed, already marked viewed.
    pub fn mark_all_unseen_as_viewed(&mut self) -> Vec<Notification> {
        self.items
            .iter_mut()
            .filter(|n| NotificationState::of(n) == NotificationState::Unseen)
            .map(|n| {
                n.viewed = true;
                n.clone()
            })
            .collect()
    }

    /// Mark a notification Dismissed.
    ///
    /// Returns the notification if this call changed it; unknown and
    /// already dismissed ids return `None`.
    pub fn dismiss(&mut self, id: i64) -> Option<Notification> {
        let n = self.items.iter_mut().find(|n| n.id == id)?;
        if n.dismissed {
            return None;
        }
        n.dismissed = true;
        Some(n.clone())
    }

    /// Number of Unseen notifications.
    #[must_use]
    pub fn badge_count(&self) -> usize {
        self.items
            .iter()
            .filter(|n| NotificationState::of(n) == NotificationState::Unseen)
            .count()
    }

    /// Non-dismissed notifications with their text, in arrival order.
    #[must_use]
    pub fn visible(&self) -> Vec<VisibleNotification> {
        self.items
            .iter()
            .filter(|n| !n.dismissed)
            .map(|n| VisibleNotification {
                id: n.id,
                state: NotificationState::of(n),
                text: render_text(n),
                sent_at: n.sent_at.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: i64) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    #[must_use]
    pub fn state(&self, id: i64) -> Option<NotificationState> {
        self.get(id).map(NotificationState::of)
    }

    /// All notifications including dismissed ones.
    #[must_use]
    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Notification feed kept in sync with pushes and the REST API.
pub struct NotificationReconciler<A: NotificationApi> {
    api: Arc<A>,
    feed: Arc<Mutex<NotificationFeed>>,
    policy: Arc<dyn ReconcilePolicy>,
}

impl<A: NotificationApi> NotificationReconciler<A> {
    pub fn new(api: Arc<A>, policy: Arc<dyn ReconcilePolicy>) -> Self {
        Self {
            api,
            feed: Arc::new(Mutex::new(NotificationFeed::new())),
            policy,
        }
    }

    /// Fetch the user's notifications and replace the local collection.
    ///
    /// # Errors
    ///
    /// Returns the API error; the local collection is unchanged.
    pub async fn load_initial(&self, username: &str) -> Result<usize, ApiError> {
        let notifications = self.api.fetch_notifications(username).await?;
        let count = notifications.len();
        self.feed.lock().load(notifications);
        debug!(username = %username, count, "notifications loaded");
        Ok(count)
    }

    /// Push handler for [`crate::session::Session::connect`].
    ///
    /// Holds the feed weakly; pushes after the reconciler is gone are dropped.
    #[must_use]
    pub fn handler(&self) -> impl Fn(Notification) + Send + Sync + use<A> {
        let feed: Weak<Mutex<NotificationFeed>> = Arc::downgrade(&self.feed);
        move |notification| {
            if let Some(feed) = feed.upgrade() {
                push_into(&mut feed.lock(), notification);
            }
        }
    }

    /// Append a pushed notification. See [`NotificationFeed::receive_push`].
    pub fn receive_push(&self, notification: Notification) -> bool {
        push_into(&mut self.feed.lock(), notification)
    }

    /// Mark all Unseen as Viewed, then confirm each one independently.
    ///
    /// Returns one handle per confirmation request.
    pub fn mark_all_unseen_as_viewed(&self) -> Vec<JoinHandle<()>> {
        let changed = self.feed.lock().mark_all_unseen_as_viewed();
        if !changed.is_empty() {
            info!(count = changed.len(), "notifications marked viewed");
        }
        changed
            .into_iter()
            .map(|notification| {
                let api = Arc::clone(&self.api);
                let policy = Arc::clone(&self.policy);
                tokio::spawn(async move {
                    match api.mark_viewed(&notification).await {
                        Ok(_) => debug!(notification_id = notification.id, "viewed confirmed"),
                        Err(e) => policy.on_viewed_failed(notification.id, &e),
                    }
                })
            })
            .collect()
    }

    /// Dismiss a notification, then confirm.
    ///
    /// Returns `None` and sends nothing for unknown or already dismissed ids.
    pub fn dismiss(&self, id: i64) -> Option<JoinHandle<()>> {
        self.feed.lock().dismiss(id)?;
        info!(notification_id = id, "notification dismissed");
        let api = Arc::clone(&self.api);
        let policy = Arc::clone(&self.policy);
        Some(tokio::spawn(async move {
            match api.dismiss(id).await {
                Ok(_) => debug!(notification_id = id, "dismiss confirmed"),
                Err(e) => policy.on_dismiss_failed(id, &e),
            }
        }))
    }

    #[must_use]
    pub fn badge_count(&self) -> usize {
        self.feed.lock().badge_count()
    }

    #[must_use]
    pub fn visible(&self) -> Vec<VisibleNotification> {
        self.feed.lock().visible()
    }

    /// Copy of the whole feed.
    #[must_use]
    pub fn snapshot(&self) -> NotificationFeed {
        self.feed.lock().clone()
    }
}

fn push_into(feed: &mut NotificationFeed, notification: Notification) -> bool {
    let id = notification.id;
    let added = feed.receive_push(notification);
    if added {
        debug!(notification_id = id, "notification received");
    } else {
        debug!(notification_id = id, "duplicate notification ignored");
    }
    added
}
