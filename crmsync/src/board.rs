//! Kanban board state and its optimistic reconciliation.
//!
//! [`Board`] partitions one client's tasks into the three status columns.
//! The partition always covers exactly the loaded tasks, each task sits in
//! exactly one column, and a task's `status` equals its column. Inside a
//! column tasks keep insertion order.
//!
//! [`BoardReconciler`] applies moves locally first and then asks the server
//! to confirm them; failures go to the configured [`ReconcilePolicy`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::NaiveDate;
use crmsync_proto::task::{Task, TaskDraft, TaskStatus};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{ApiError, TaskApi};
use crate::policy::{FailedMove, ReconcilePolicy};

/// Errors from board operations.
#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    /// Source and target column are the same.
    #[error("task is already in {0}")]
    SameColumn(TaskStatus),

    /// The task is not in the column the move starts from.
    #[error("task {task_id} is not in {column}")]
    TaskNotFound { task_id: i64, column: TaskStatus },

    /// A REST call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The three status columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Board {
    todo: Vec<Task>,
    in_progress: Vec<Task>,
    done: Vec<Task>,
    /// Column changes per task since the last load.
    moves: HashMap<i64, u64>,
}

impl Board {
    /// Partition `tasks` by status. Later duplicates of an id are skipped.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut board = Self::default();
        board.load(tasks);
        board
    }

    /// Replace the whole partition.
    pub fn load(&mut self, tasks: impl IntoIterator<Item = Task>) {
        self.todo.clear();
        self.in_progress.clear();
        self.done.clear();
        self.moves.clear();
        let mut seen = HashSet::new();
        for task in tasks {
            if seen.insert(task.id) {
                self.column_mut(task.status).push(task);
            }
        }
    }

    /// Tasks in one column, in insertion order.
    #[must_use]
    pub fn column(&self, status: TaskStatus) -> &[Task] {
        match status {
            TaskStatus::Todo => &self.todo,
            TaskStatus::InProgress => &self.in_progress,
            TaskStatus::Done => &self.done,
        }
    }

    fn column_mut(&mut self, status: TaskStatus) -> &mut Vec<Task> {
        match status {
            TaskStatus::Todo => &mut self.todo,
            TaskStatus::InProgress => &mut self.in_progress,
            TaskStatus::Done => &mut self.done,
        }
    }

    /// Find a task by id.
    #[must_use]
    pub fn find(&self, task_id: i64) -> Option<&Task> {
        TaskStatus::ALL
            .iter()
            .find_map(|&s| self.column(s).iter().find(|t| t.id == task_id))
    }

    /// Column the task currently sits in.
    #[must_use]
    pub fn status_of(&self, task_id: i64) -> Option<TaskStatus> {
        self.find(task_id).map(|t| t.status)
    }

    /// Move a task from one column to the end of another and set its status.
    ///
    /// # Errors
    ///
    /// - [`BoardError::SameColumn`] if `from == to`.
    /// - [`BoardError::TaskNotFound`] if the task is not in `from`.
    pub fn move_task(
        &mut self,
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<(), BoardError> {
        if from == to {
            return Err(BoardError::SameColumn(from));
        }
        let source = self.column_mut(from);
        let index = source
            .iter()
            .position(|t| t.id == task_id)
            .ok_or(BoardError::TaskNotFound {
                task_id,
                column: from,
            })?;
        let mut task = source.remove(index);
        task.status = to;
        self.column_mut(to).push(task);
        self.bump_moves(task_id);
        Ok(())
    }

    /// How many times the task changed column since the last load.
    #[must_use]
    pub fn move_generation(&self, task_id: i64) -> u64 {
        self.moves.get(&task_id).copied().unwrap_or(0)
    }

    fn bump_moves(&mut self, task_id: i64) {
        *self.moves.entry(task_id).or_default() += 1;
    }

    /// Add a task to the end of its status column.
    ///
    /// A task whose id is already on the board is updated instead.
    pub fn append(&mut self, task: Task) {
        if !self.apply_update(task.clone()) {
            self.column_mut(task.status).push(task);
        }
    }

    /// Replace a task that is already on the board.
    ///
    /// Same status: replaced in place. New status: moved to the end of the
    /// new column. Returns `false` if the task is not on the board.
    pub fn apply_update(&mut self, task: Task) -> bool {
        let Some(current) = self.status_of(task.id) else {
            return false;
        };
        let column = self.column_mut(current);
        let Some(index) = column.iter().position(|t| t.id == task.id) else {
            return false;
        };
        if current == task.status {
            column[index] = task;
        } else {
            column.remove(index);
            let task_id = task.id;
            self.column_mut(task.status).push(task);
            self.bump_moves(task_id);
        }
        true
    }

    /// Total number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.todo.len() + self.in_progress.len() + self.done.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filtered projection. The board itself is not touched.
    #[must_use]
    pub fn view(&self, filter: &BoardFilter, today: NaiveDate) -> BoardView {
        let pick = |status: TaskStatus| -> Vec<Task> {
            self.column(status)
                .iter()
                .filter(|t| filter.matches(t, today))
                .cloned()
                .collect()
        };
        BoardView {
            todo: pick(TaskStatus::Todo),
            in_progress: pick(TaskStatus::InProgress),
            done: pick(TaskStatus::Done),
        }
    }
}

/// Deadline filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineFilter {
    /// Due before today and not done.
    Overdue,
    /// Everything that is not overdue.
    NotOverdue,
}

/// Board filter; every set criterion must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardFilter {
    /// Case-insensitive substring of the description.
    pub search: Option<String>,
    /// Assigned contact id.
    pub contact_id: Option<i64>,
    pub deadline: Option<DeadlineFilter>,
}

impl BoardFilter {
    /// Whether `task` passes the filter on `today`.
    #[must_use]
    pub fn matches(&self, task: &Task, today: NaiveDate) -> bool {
        if let Some(term) = self.search.as_deref().filter(|s| !s.is_empty())
            && !task
                .description
                .to_lowercase()
                .contains(&term.to_lowercase())
        {
            return false;
        }
        if let Some(contact_id) = self.contact_id
            && task.contact_id() != Some(contact_id)
        {
            return false;
        }
        match self.deadline {
            Some(DeadlineFilter::Overdue) => task.is_overdue(today),
            Some(DeadlineFilter::NotOverdue) => !task.is_overdue(today),
            None => true,
        }
    }
}

/// Read-only filtered copy of the board.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardView {
    pub todo: Vec<Task>,
    pub in_progress: Vec<Task>,
    pub done: Vec<Task>,
}

impl BoardView {
    #[must_use]
    pub fn column(&self, status: TaskStatus) -> &[Task] {
        match status {
            TaskStatus::Todo => &self.todo,
            TaskStatus::InProgress => &self.in_progress,
            TaskStatus::Done => &self.done,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.todo.len() + self.in_progress.len() + self.done.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Board of one client kept in sync with the REST API.
pub struct BoardReconciler<A: TaskApi> {
    api: Arc<A>,
    client_id: i64,
    board: Arc<Mutex<Board>>,
    policy: Arc<dyn ReconcilePolicy>,
}

impl<A: TaskApi> BoardReconciler<A> {
    /// Create an empty board for `client_id`.
    pub fn new(api: Arc<A>, client_id: i64, policy: Arc<dyn ReconcilePolicy>) -> Self {
        Self {
            api,
            client_id,
            board: Arc::new(Mutex::new(Board::default())),
            policy,
        }
    }

    #[must_use]
    pub const fn client_id(&self) -> i64 {
        self.client_id
    }

    /// Fetch the client's tasks and load them. Returns the task count.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::Api`] if the fetch fails; the board is unchanged.
    pub async fn refresh(&self) -> Result<usize, BoardError> {
        let tasks = self.api.fetch_tasks_by_client(self.client_id).await?;
        self.load(tasks);
        Ok(self.board.lock().len())
    }

    /// Replace the board contents, discarding optimistic state.
    pub fn load(&self, tasks: Vec<Task>) {
        self.board.lock().load(tasks);
        debug!(client_id = self.client_id, "board loaded");
    }

    /// Copy of the current board.
    #[must_use]
    pub fn snapshot(&self) -> Board {
        self.board.lock().clone()
    }

    /// Filtered projection of the current board.
    #[must_use]
    pub fn view(&self, filter: &BoardFilter, today: NaiveDate) -> BoardView {
        self.board.lock().view(filter, today)
    }

    /// Move a task locally, then request the status change.
    ///
    /// The local move is complete when this returns. The returned handle
    /// resolves once the request and any failure handling are done;
    /// dropping it does not cancel the request.
    ///
    /// # Errors
    ///
    /// Returns the [`Board::move_task`] precondition errors; nothing is sent.
    pub fn move_task(
        &self,
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<JoinHandle<()>, BoardError> {
        let generation = {
            let mut board = self.board.lock();
            board.move_task(task_id, from, to)?;
            board.move_generation(task_id)
        };
        info!(task_id, from = %from, to = %to, "task moved");

        let api = Arc::clone(&self.api);
        let board = Arc::downgrade(&self.board);
        let policy = Arc::clone(&self.policy);
        Ok(tokio::spawn(async move {
            let result = api.update_task_status(task_id, to).await;
            let failed = FailedMove {
                task_id,
                from,
                to,
                generation,
            };
            confirm_move(result, &board, policy.as_ref(), failed);
        }))
    }

    /// Drag-and-drop entry point.
    ///
    /// `over` is the column id under the pointer on release (`TODO`,
    /// `IN_PROGRESS`, `DONE`). Returns `None` without doing anything when
    /// there is no target, the target is unknown, the task is not on the
    /// board, or the task was dropped on its own column.
    pub fn handle_drop(&self, task_id: i64, over: Option<&str>) -> Option<JoinHandle<()>> {
        let to = TaskStatus::from_column_id(over?)?;
        let from = self.board.lock().status_of(task_id)?;
        if from == to {
            return None;
        }
        self.move_task(task_id, from, to).ok()
    }

    /// Create a task in a column and append the server's copy.
    ///
    /// # Errors
    ///
    /// Returns [`BoardError::Api`] if creation fails; the board is unchanged.
    pub async fn create_in_column(
        &self,
        status: TaskStatus,
        mut draft: TaskDraft,
    ) -> Result<Task, BoardError> {
        draft.status = status;
        let created = self.api.create_task(&draft).await?;
        info!(task_id = created.id, status = %created.status, "task created");
        self.board.lock().append(created.clone());
        Ok(created)
    }

    /// Apply an edited task. Returns `false` if it is not on the board.
    pub fn apply_update(&self, task: Task) -> bool {
        self.board.lock().apply_update(task)
    }
}

fn confirm_move(
    result: Result<Task, ApiError>,
    board: &Weak<Mutex<Board>>,
    policy: &dyn ReconcilePolicy,
    failed: FailedMove,
) {
    match result {
        Ok(task) => debug!(task_id = task.id, status = %task.status, "status change confirmed"),
        Err(e) => {
            let Some(board) = board.upgrade() else {
                debug!(task_id = failed.task_id, "board gone, ignoring failed update");
                return;
            };
            policy.on_move_failed(&mut board.lock(), &failed, &e);
        }
    }
}
