//! What to do when a server confirmation fails after an optimistic change.
//!
//! Optimistic mutations are applied locally before the request is sent.
//! When the request fails, the reconciler hands the failure to a
//! [`ReconcilePolicy`]. [`KeepOptimistic`] logs and keeps the local state;
//! [`RevertOnFailure`] undoes failed board moves. Notification transitions
//! are never reverted: Dismissed is terminal and Viewed never returns to
//! Unseen.

use std::fmt;
use std::sync::Arc;

use crmsync_proto::task::TaskStatus;
use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::board::Board;

/// A board move whose status-change request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedMove {
    pub task_id: i64,
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// [`Board::move_generation`] right after the local move.
    pub generation: u64,
}

/// Failure handling for optimistic changes.
///
/// Hooks run synchronously with the affected state locked; they must not
/// block.
pub trait ReconcilePolicy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// A status-change request for a moved task failed.
    fn on_move_failed(&self, _board: &mut Board, failed: &FailedMove, error: &ApiError) {
        tracing::warn!(
            task_id = failed.task_id,
            from = %failed.from,
            to = %failed.to,
            error = %error,
            policy = self.name(),
            "task status update failed, keeping local move"
        );
    }

    /// A mark-as-viewed confirmation failed.
    fn on_viewed_failed(&self, notification_id: i64, error: &ApiError) {
        tracing::warn!(
            notification_id,
            error = %error,
            policy = self.name(),
            "mark-as-viewed not confirmed"
        );
    }

    /// A dismiss confirmation failed.
    fn on_dismiss_failed(&self, notification_id: i64, error: &ApiError) {
        tracing::warn!(
            notification_id,
            error = %error,
            policy = self.name(),
            "dismiss not confirmed"
        );
    }
}

/// Log failures and keep every optimistic change.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepOptimistic;

impl ReconcilePolicy for KeepOptimistic {
    fn name(&self) -> &'static str {
        "keep-optimistic"
    }
}

/// Move a task back when its status change fails.
///
/// The task is only moved back if the failed move was its last column change;
/// a later move, even one back to the same column, or a reload wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct RevertOnFailure;

impl ReconcilePolicy for RevertOnFailure {
    fn name(&self) -> &'static str {
        "revert-on-failure"
    }

    fn on_move_failed(&self, board: &mut Board, failed: &FailedMove, error: &ApiError) {
        if board.move_generation(failed.task_id) != failed.generation
            || board.status_of(failed.task_id) != Some(failed.to)
        {
            tracing::info!(
                task_id = failed.task_id,
                error = %error,
                "task moved again since the failed update, not reverting"
            );
            return;
        }
        match board.move_task(failed.task_id, failed.to, failed.from) {
            Ok(()) => tracing::warn!(
                task_id = failed.task_id,
                back_to = %failed.from,
                error = %error,
                "task status update failed, move reverted"
            ),
            Err(e) => tracing::warn!(task_id = failed.task_id, error = %e, "revert failed"),
        }
    }
}

/// Configurable choice of policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    KeepOptimistic,
    RevertOnFailure,
}

impl PolicyKind {
    /// Instantiate the policy.
    #[must_use]
    pub fn build(self) -> Arc<dyn ReconcilePolicy> {
        match self {
            Self::KeepOptimistic => Arc::new(KeepOptimistic),
            Self::RevertOnFailure => Arc::new(RevertOnFailure),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepOptimistic => write!(f, "keep-optimistic"),
            Self::RevertOnFailure => write!(f, "revert-on-failure"),
        }
    }
}
