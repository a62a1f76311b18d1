//! Reducer that folds session events into a [`SessionState`].
//!
//! The reducer is pure: `project(events)` depends only on the ordered events,
//! and folding a prefix then the suffix equals folding the whole sequence.
//! Unknown `(type, action)` pairs, and known actions whose meta cannot be
//! read, are skipped so older binaries can replay newer logs.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::core::completion::check_complete;
use crate::core::types::{
    ControlState, Event, EventKind, IterationRecord, Note, NoteKind, SessionState, Task,
    TaskStatus, clamp_priority,
};

/// Fold `events` from an empty state.
pub fn project(events: &[Event]) -> SessionState {
    let mut state = SessionState::default();
    apply_events(&mut state, events);
    state
}

/// Fold `events` onto an existing state.
pub fn apply_events(state: &mut SessionState, events: &[Event]) {
    for event in events {
        apply_event(state, event);
    }
}

/// Apply a single event in place.
pub fn apply_event(state: &mut SessionState, event: &Event) {
    match event.kind {
        EventKind::Task => apply_task(state, event),
        EventKind::Note => apply_note(state, event),
        EventKind::Iteration => apply_iteration(state, event),
        EventKind::Control => apply_control(state, event),
        EventKind::Unknown => {}
    }
}

fn apply_task(state: &mut SessionState, event: &Event) {
    match event.action.as_str() {
        "add" => {
            let id = meta_str(&event.meta, "id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("t-{}", event.id));
            if state.task(&id).is_some() {
                return;
            }
            let priority = meta_i64(&event.meta, "priority").map_or(0, clamp_priority);
            let dependencies = meta_ids(&event.meta, "dependencies").unwrap_or_default();
            state.tasks.push(Task {
                id,
                content: event.data.clone(),
                status: TaskStatus::Remaining,
                priority,
                dependencies,
                created_seq: event.id,
            });
            state.control.complete = false;
        }
        "status" => {
            let Some(status) = meta_str(&event.meta, "status").and_then(|s| s.parse().ok())
            else {
                return;
            };
            let Some(task) = meta_str(&event.meta, "id").and_then(|id| state.task_mut(id)) else {
                return;
            };
            task.status = status;
            if status != TaskStatus::Completed {
                state.control.complete = false;
            }
        }
        "priority" => {
            let Some(priority) = meta_i64(&event.meta, "priority") else {
                return;
            };
            if let Some(task) = meta_str(&event.meta, "id").and_then(|id| state.task_mut(id)) {
                task.priority = clamp_priority(priority);
            }
        }
        "depends" => {
            let Some(dependencies) = meta_ids(&event.meta, "dependencies") else {
                return;
            };
            if let Some(task) = meta_str(&event.meta, "id").and_then(|id| state.task_mut(id)) {
                task.dependencies = dependencies;
            }
        }
        _ => {}
    }
}

fn apply_note(state: &mut SessionState, event: &Event) {
    if event.action != "add" {
        return;
    }
    let Some(kind) = meta_str(&event.meta, "type").and_then(|s| s.parse::<NoteKind>().ok())
    else {
        return;
    };
    let id = meta_str(&event.meta, "id")
        .map(str::to_string)
        .unwrap_or_else(|| format!("n-{}", event.id));
    state.notes.push(Note {
        id,
        kind,
        content: event.data.clone(),
        timestamp: event.timestamp,
    });
}

fn apply_iteration(state: &mut SessionState, event: &Event) {
    if event.action != "summary" {
        return;
    }
    let next_number = state.iterations.last().map_or(1, |rec| rec.number + 1);
    let number = meta_i64(&event.meta, "number")
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(next_number);
    state.iterations.push(IterationRecord {
        number,
        summary: event.data.clone(),
        timestamp: event.timestamp,
    });
}

fn apply_control(state: &mut SessionState, event: &Event) {
    if event.action == "complete" {
        // Only an all-completed task list can mark the session complete.
        if check_complete(state).is_ok() {
            state.control.complete = true;
        }
        return;
    }
    let control = &mut state.control;
    match event.action.as_str() {
        "pause" => control.paused = true,
        "resume" => control.paused = false,
        "iteration_start" => {
            if let Some(n) = meta_i64(&event.meta, "iteration").and_then(|n| u32::try_from(n).ok())
            {
                control.last_iteration = control.last_iteration.max(n);
            }
        }
        "iteration_complete" => control.last_error = None,
        "iteration_error" => {
            control.last_error = Some(
                meta_str(&event.meta, "error")
                    .unwrap_or("unknown error")
                    .to_string(),
            );
        }
        "reset" => {
            let reset_count = control.reset_count + 1;
            let last_iteration = control.last_iteration;
            *state = SessionState {
                control: ControlState {
                    reset_count,
                    last_iteration,
                    ..ControlState::default()
                },
                ..SessionState::default()
            };
        }
        _ => {}
    }
}

fn meta_str<'a>(meta: &'a Value, key: &str) -> Option<&'a str> {
    meta.get(key).and_then(Value::as_str)
}

fn meta_i64(meta: &Value, key: &str) -> Option<i64> {
    meta.get(key).and_then(Value::as_i64)
}

/// Read a list of ids. `None` when the key is missing or not an array of strings.
fn meta_ids(meta: &Value, key: &str) -> Option<BTreeSet<String>> {
    let items = meta.get(key)?.as_array()?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EventBuilder, task_add, task_status};

    #[test]
    fn task_add_clamps_priority_and_keeps_creation_order() {
        let mut log = EventBuilder::new("s");
        let events = vec![
            log.push(task_add("a", "first", 9, &[])),
            log.push(task_add("b", "second", -1, &["a"])),
        ];

        let state = project(&events);
        assert_eq!(state.tasks.len(), 2);
        assert_eq!(state.tasks[0].id, "a");
        assert_eq!(state.tasks[0].priority, 4);
        assert_eq!(state.tasks[1].priority, 0);
        assert!(state.tasks[1].dependencies.contains("a"));
        assert_eq!(state.tasks[1].status, TaskStatus::Remaining);
    }

    /// Unknown pairs and malformed meta are skipped rather than failing the fold.
    #[test]
    fn unknown_actions_and_bad_meta_are_ignored() {
        let mut log = EventBuilder::new("s");
        let events = vec![
            log.push(task_add("a", "first", 1, &[])),
            log.push(
                crate::core::types::NewEvent::new(EventKind::Task, "archive")
                    .with_meta(serde_json::json!({ "id": "a" })),
            ),
            log.push(
                crate::core::types::NewEvent::new(EventKind::Task, "status")
                    .with_meta(serde_json::json!({ "id": "a", "status": "exploded" })),
            ),
            log.push(task_status("missing", TaskStatus::Completed)),
        ];

        let state = project(&events);
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].status, TaskStatus::Remaining);
    }

    #[test]
    fn complete_flag_is_cleared_by_new_work() {
        let mut log = EventBuilder::new("s");
        let mut events = vec![
            log.push(task_add("a", "first", 1, &[])),
            log.push(task_status("a", TaskStatus::Completed)),
            log.push(crate::core::types::NewEvent::new(
                EventKind::Control,
                "complete",
            )),
        ];
        assert!(project(&events).control.complete);

        events.push(log.push(task_add("b", "more", 1, &[])));
        assert!(!project(&events).control.complete);
    }

    /// A `complete` event that lands while a task is open changes nothing.
    #[test]
    fn complete_is_ignored_while_tasks_are_open() {
        let mut log = EventBuilder::new("s");
        let events = vec![
            log.push(task_add("a", "first", 1, &[])),
            log.push(crate::core::types::NewEvent::new(
                EventKind::Control,
                "complete",
            )),
        ];

        let state = project(&events);
        assert!(!state.control.complete);
        assert_eq!(state.tasks[0].status, TaskStatus::Remaining);
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        let mut log = EventBuilder::new("s");
        let events = vec![
            log.push(task_add("a", "first", 1, &[])),
            log.push(crate::core::types::NewEvent::new(EventKind::Unknown, "tick")),
        ];
        assert_eq!(project(&events), project(&events[..1]));
    }

    /// Reset clears every projection but keeps the reset count and iteration number.
    #[test]
    fn reset_clears_projection() {
        let mut log = EventBuilder::new("s");
        let events = vec![
            log.push(task_add("a", "first", 1, &[])),
            log.push(
                crate::core::types::NewEvent::new(EventKind::Note, "add")
                    .with_meta(serde_json::json!({ "id": "n1", "type": "tip" }))
                    .with_data("remember"),
            ),
            log.push(
                crate::core::types::NewEvent::new(EventKind::Control, "iteration_start")
                    .with_meta(serde_json::json!({ "iteration": 3 })),
            ),
            log.push(crate::core::types::NewEvent::new(EventKind::Control, "reset")),
            log.push(task_add("b", "after reset", 2, &[])),
        ];

        let state = project(&events);
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].id, "b");
        assert!(state.notes.is_empty());
        assert_eq!(state.control.reset_count, 1);
        // Iteration numbering continues across a reset.
        assert_eq!(state.control.last_iteration, 3);
    }

    /// Folding in arbitrary batch sizes yields the same projection as one batch.
    #[test]
    fn batched_replay_matches_single_pass() {
        let mut log = EventBuilder::new("s");
        let events = vec![
            log.push(task_add("a", "first", 2, &[])),
            log.push(task_add("b", "second", 4, &["a"])),
            log.push(task_status("a", TaskStatus::Completed)),
            log.push(
                crate::core::types::NewEvent::new(EventKind::Iteration, "summary")
                    .with_data("did a"),
            ),
            log.push(
                crate::core::types::NewEvent::new(EventKind::Control, "iteration_start")
                    .with_meta(serde_json::json!({ "iteration": 2 })),
            ),
            log.push(task_status("b", TaskStatus::InProgress)),
        ];

        let whole = project(&events);
        for split in 0..=events.len() {
            let mut state = project(&events[..split]);
            apply_events(&mut state, &events[split..]);
            assert_eq!(state, whole, "split at {split}");
        }
        for chunk in 1..=3 {
            let mut state = SessionState::default();
            for batch in events.chunks(chunk) {
                apply_events(&mut state, batch);
            }
            assert_eq!(state, whole, "chunk size {chunk}");
        }
        assert_eq!(whole.iterations[0].number, 1);
        assert_eq!(whole.control.last_iteration, 2);
    }
}
