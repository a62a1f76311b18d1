//! Session-scoped facade over an [`EventLog`].
//!
//! Every mutation is an append; every read replays the session and projects
//! it. There is no cached state to drift from the log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tracing::{debug, info};

use crate::core::completion::check_complete;
use crate::core::projection::project;
use crate::core::selector::next_task;
use crate::core::types::{
    Event, EventKind, IterationRecord, NewEvent, Note, NoteKind, SessionState, Task, TaskStatus,
    clamp_priority,
};
use crate::store::{EventLog, validate_session_name};

/// Typed access to one session of an event log.
#[derive(Clone)]
pub struct SessionStore {
    log: Arc<dyn EventLog>,
    session: String,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(log: Arc<dyn EventLog>, session: impl Into<String>) -> Result<Self> {
        let session = session.into();
        validate_session_name(&session)?;
        Ok(Self { log, session })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Append a raw event to this session.
    pub fn append(
        &self,
        kind: EventKind,
        action: &str,
        meta: serde_json::Value,
        data: impl Into<String>,
    ) -> Result<Event> {
        let event = NewEvent::new(kind, action)
            .with_meta(meta)
            .with_data(data);
        self.log
            .append(&self.session, event)
            .with_context(|| format!("append {}.{action} to session {}", kind.as_str(), self.session))
    }

    pub fn replay(&self) -> Result<Vec<Event>> {
        self.log
            .replay(&self.session)
            .with_context(|| format!("replay session {}", self.session))
    }

    /// Current projection of the session.
    pub fn state(&self) -> Result<SessionState> {
        Ok(project(&self.replay()?))
    }

    pub fn next_task(&self) -> Result<Option<Task>> {
        Ok(next_task(&self.state()?).cloned())
    }

    pub fn add_task(&self, content: &str, priority: i64, dependencies: &[String]) -> Result<Task> {
        if content.trim().is_empty() {
            return Err(anyhow!("task content must not be empty"));
        }
        let id = generate_id("t");
        let event = self.append(
            EventKind::Task,
            "add",
            json!({ "id": id, "priority": priority, "dependencies": dependencies }),
            content,
        )?;
        debug!(task_id = %id, "task added");
        Ok(Task {
            id,
            content: content.to_string(),
            status: TaskStatus::Remaining,
            priority: clamp_priority(priority),
            dependencies: dependencies.iter().cloned().collect(),
            created_seq: event.id,
        })
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<Event> {
        self.require_task(id)?;
        self.append(
            EventKind::Task,
            "status",
            json!({ "id": id, "status": status.as_str() }),
            "",
        )
    }

    pub fn set_task_priority(&self, id: &str, priority: i64) -> Result<Event> {
        self.require_task(id)?;
        self.append(
            EventKind::Task,
            "priority",
            json!({ "id": id, "priority": priority }),
            "",
        )
    }

    /// Replace the dependency set of a task.
    pub fn set_task_dependencies(&self, id: &str, dependencies: &[String]) -> Result<Event> {
        self.require_task(id)?;
        self.append(
            EventKind::Task,
            "depends",
            json!({ "id": id, "dependencies": dependencies }),
            "",
        )
    }

    pub fn add_note(&self, kind: NoteKind, content: &str) -> Result<Note> {
        let id = generate_id("n");
        let event = self.append(
            EventKind::Note,
            "add",
            json!({ "id": id, "type": kind.as_str() }),
            content,
        )?;
        Ok(Note {
            id,
            kind,
            content: content.to_string(),
            timestamp: event.timestamp,
        })
    }

    pub fn notes(&self, kind: Option<NoteKind>) -> Result<Vec<Note>> {
        let state = self.state()?;
        Ok(state.notes_of(kind).into_iter().cloned().collect())
    }

    pub fn record_iteration_summary(&self, summary: &str) -> Result<Event> {
        self.append(EventKind::Iteration, "summary", json!({}), summary)
    }

    /// Last `limit` iteration records, oldest first.
    pub fn history(&self, limit: usize) -> Result<Vec<IterationRecord>> {
        Ok(self.state()?.recent_iterations(limit).to_vec())
    }

    pub fn iteration_started(&self, iteration: u32) -> Result<Event> {
        self.control("iteration_start", json!({ "iteration": iteration }))
    }

    pub fn iteration_completed(
        &self,
        iteration: u32,
        stop_reason: &str,
        duration: Duration,
    ) -> Result<Event> {
        self.control(
            "iteration_complete",
            json!({
                "iteration": iteration,
                "stop_reason": stop_reason,
                "duration_ms": u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            }),
        )
    }

    pub fn iteration_failed(&self, iteration: u32, error: &str) -> Result<Event> {
        self.control(
            "iteration_error",
            json!({ "iteration": iteration, "error": error }),
        )
    }

    pub fn pause(&self) -> Result<Event> {
        self.control("pause", json!({}))
    }

    pub fn resume(&self) -> Result<Event> {
        self.control("resume", json!({}))
    }

    /// Clear the projection. The log itself keeps every prior event.
    pub fn reset(&self) -> Result<Event> {
        info!(session = %self.session, "resetting session projection");
        self.control("reset", json!({}))
    }

    /// Mark the session complete.
    ///
    /// Fails with [`crate::core::completion::IncompleteTasks`] (retrievable via
    /// `downcast_ref`) when any task is not completed.
    ///
    /// The appended event only takes effect if every task is still completed
    /// when it is folded. A task added concurrently by another process makes
    /// this call fail too.
    pub fn complete(&self) -> Result<Event> {
        check_complete(&self.state()?)?;
        let event = self.control("complete", json!({}))?;
        let state = self.state()?;
        if !state.control.complete {
            check_complete(&state)?;
        }
        info!(session = %self.session, tasks = state.tasks.len(), "session complete");
        Ok(event)
    }

    pub fn close(&self) -> Result<()> {
        self.log.close().context("close event log")
    }

    fn control(&self, action: &str, meta: serde_json::Value) -> Result<Event> {
        self.append(EventKind::Control, action, meta, "")
    }

    fn require_task(&self, id: &str) -> Result<()> {
        if self.state()?.task(id).is_none() {
            return Err(anyhow!("unknown task '{id}' in session {}", self.session));
        }
        Ok(())
    }
}

fn generate_id(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &uuid[..8])
}
