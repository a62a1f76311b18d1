//! Shared deterministic types for the session model.
//!
//! Events are the only persisted representation; every other type here is a
//! projection derived by folding events in append order.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Highest task priority. Values above are clamped down.
pub const MAX_PRIORITY: u8 = 4;

/// Top-level event category.
///
/// Categories this binary does not know decode as `Unknown` and are ignored
/// by the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Task,
    Note,
    Iteration,
    Control,
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Task => "task",
            EventKind::Note => "note",
            EventKind::Iteration => "iteration",
            EventKind::Control => "control",
            EventKind::Unknown => "unknown",
        }
    }
}

/// Immutable record in a session's append-only log.
///
/// `id` is assigned by the log on append and increases monotonically within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub session: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub action: String,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub data: String,
}

/// An event before the log has assigned its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub action: String,
    pub meta: Value,
    pub data: String,
}

impl NewEvent {
    pub fn new(kind: EventKind, action: impl Into<String>) -> Self {
        Self {
            kind,
            action: action.into(),
            meta: Value::Null,
            data: String::new(),
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Remaining,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Remaining => "remaining",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remaining" => Ok(TaskStatus::Remaining),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(format!(
                "unknown task status '{other}' (expected remaining|in_progress|completed|blocked)"
            )),
        }
    }
}

/// A unit of work tracked for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub content: String,
    pub status: TaskStatus,
    /// 0..=4, 4 is highest.
    pub priority: u8,
    pub dependencies: BTreeSet<String>,
    /// Id of the `task.add` event; defines creation order.
    pub created_seq: u64,
}

/// Clamp an arbitrary integer priority into `0..=MAX_PRIORITY`.
pub fn clamp_priority(raw: i64) -> u8 {
    raw.clamp(0, i64::from(MAX_PRIORITY)) as u8
}

/// Category of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Learning,
    Stuck,
    Tip,
    Decision,
}

impl NoteKind {
    pub const ALL: [NoteKind; 4] = [
        NoteKind::Learning,
        NoteKind::Stuck,
        NoteKind::Tip,
        NoteKind::Decision,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NoteKind::Learning => "learning",
            NoteKind::Stuck => "stuck",
            NoteKind::Tip => "tip",
            NoteKind::Decision => "decision",
        }
    }
}

impl fmt::Display for NoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "learning" => Ok(NoteKind::Learning),
            "stuck" => Ok(NoteKind::Stuck),
            "tip" => Ok(NoteKind::Tip),
            "decision" => Ok(NoteKind::Decision),
            other => Err(format!(
                "unknown note type '{other}' (expected learning|stuck|tip|decision)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NoteKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Summary recorded for a finished iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub number: u32,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

/// Flags derived from `control` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub complete: bool,
    pub paused: bool,
    /// Number of `control.reset` events folded so far.
    pub reset_count: u32,
    /// Highest iteration number seen in an `iteration_start` event.
    pub last_iteration: u32,
    /// Error text of the most recent failed iteration, cleared by a successful one.
    pub last_error: Option<String>,
}

/// Materialized session projection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Tasks in creation order.
    pub tasks: Vec<Task>,
    pub notes: Vec<Note>,
    pub iterations: Vec<IterationRecord>,
    pub control: ControlState,
}

impl SessionState {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub(crate) fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Notes in append order, optionally restricted to one kind.
    pub fn notes_of(&self, kind: Option<NoteKind>) -> Vec<&Note> {
        self.notes
            .iter()
            .filter(|note| kind.is_none_or(|k| note.kind == k))
            .collect()
    }

    /// The most recent `limit` iteration records, oldest first.
    pub fn recent_iterations(&self, limit: usize) -> &[IterationRecord] {
        let start = self.iterations.len().saturating_sub(limit);
        &self.iterations[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_priority_bounds_out_of_range_values() {
        assert_eq!(clamp_priority(-3), 0);
        assert_eq!(clamp_priority(2), 2);
        assert_eq!(clamp_priority(99), MAX_PRIORITY);
    }

    #[test]
    fn task_status_parses_wire_names() {
        assert_eq!(
            "in_progress".parse::<TaskStatus>(),
            Ok(TaskStatus::InProgress)
        );
        assert!("done".parse::<TaskStatus>().is_err());
    }

    /// Events serialize their kind under the `type` key used by the log format.
    #[test]
    fn event_serializes_kind_as_type() {
        let event = Event {
            id: 1,
            timestamp: DateTime::<Utc>::from_timestamp(0, 0).expect("timestamp"),
            session: "s".to_string(),
            kind: EventKind::Note,
            action: "add".to_string(),
            meta: Value::Null,
            data: "hello".to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "note");
        assert_eq!(json["action"], "add");
    }

    #[test]
    fn unrecognized_event_type_decodes_as_unknown() {
        let event: Event = serde_json::from_str(
            r#"{"id":2,"timestamp":"2024-01-01T00:00:00Z","session":"s","type":"metric","action":"tick"}"#,
        )
        .expect("decode");
        assert_eq!(event.kind, EventKind::Unknown);
        assert_eq!(event.action, "tick");
    }
}
