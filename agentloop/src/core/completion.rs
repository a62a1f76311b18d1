//! Validation for marking a session complete.

use thiserror::Error;

use crate::core::types::{SessionState, TaskStatus};

/// A task that keeps the session from completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingTask {
    pub id: String,
    pub status: TaskStatus,
    pub content: String,
}

/// Returned when completion is requested while tasks are still open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot complete session: {} task(s) not completed: {}", .outstanding.len(), render(.outstanding))]
pub struct IncompleteTasks {
    pub outstanding: Vec<OutstandingTask>,
}

/// Succeeds only when every task is `completed`. A session with no tasks can complete.
pub fn check_complete(state: &SessionState) -> Result<(), IncompleteTasks> {
    let outstanding: Vec<OutstandingTask> = state
        .tasks
        .iter()
        .filter(|task| task.status != TaskStatus::Completed)
        .map(|task| OutstandingTask {
            id: task.id.clone(),
            status: task.status,
            content: task.content.clone(),
        })
        .collect();
    if outstanding.is_empty() {
        return Ok(());
    }
    Err(IncompleteTasks { outstanding })
}

fn render(outstanding: &[OutstandingTask]) -> String {
    outstanding
        .iter()
        .map(|task| format!("{} ({}): {}", task.id, task.status, task.content))
        .collect::<Vec<_>>()
        .join("; ")
}
