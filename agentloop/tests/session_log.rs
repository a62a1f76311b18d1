//! Session log persistence: the projection is rebuilt identically from the
//! JSONL file after reopening, and resets never lose history.

use std::sync::Arc;

use agentloop::core::completion::IncompleteTasks;
use agentloop::core::types::{NoteKind, TaskStatus};
use agentloop::store::{JsonlEventLog, SessionStore};

fn open(dir: &std::path::Path, session: &str) -> SessionStore {
    let log = JsonlEventLog::open(dir).expect("open log");
    SessionStore::new(Arc::new(log), session).expect("store")
}

#[test]
fn projection_survives_reopen() {
    let temp = tempfile::tempdir().expect("tempdir");
    let before = {
        let store = open(temp.path(), "demo");
        let parser = store.add_task("write the parser", 1, &[]).expect("add");
        let cli = store
            .add_task("wire the CLI", 0, &[parser.id.clone()])
            .expect("add");
        store
            .set_task_status(&parser.id, TaskStatus::InProgress)
            .expect("status");
        store.set_task_priority(&cli.id, 3).expect("priority");
        store
            .add_note(NoteKind::Decision, "use serde for the wire format")
            .expect("note");
        store.iteration_started(1).expect("start");
        store.record_iteration_summary("parsed headers").expect("summary");
        store.state().expect("state")
    };

    let reopened = open(temp.path(), "demo");
    assert_eq!(reopened.state().expect("state"), before);
    assert_eq!(before.control.last_iteration, 1);
    assert_eq!(before.tasks[1].priority, 3);

    let other = open(temp.path(), "other");
    assert!(other.state().expect("state").tasks.is_empty());
}

#[test]
fn completion_requires_every_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open(temp.path(), "demo");
    let task = store.add_task("only task", 2, &[]).expect("add");

    let err = store.complete().expect_err("task outstanding");
    let incomplete = err.downcast_ref::<IncompleteTasks>().expect("typed error");
    assert_eq!(incomplete.outstanding[0].id, task.id);

    store
        .set_task_status(&task.id, TaskStatus::Completed)
        .expect("status");
    store.complete().expect("complete");
    assert!(store.state().expect("state").control.complete);

    // New work reopens the session.
    store.add_task("follow-up", 2, &[]).expect("add");
    assert!(!store.state().expect("state").control.complete);
}

#[test]
fn reset_clears_projection_but_keeps_log() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = open(temp.path(), "demo");
    store.add_task("a", 2, &[]).expect("add");
    store.add_note(NoteKind::Tip, "t").expect("note");
    let events_before = store.replay().expect("replay").len();

    store.reset().expect("reset");

    let state = store.state().expect("state");
    assert!(state.tasks.is_empty() && state.notes.is_empty());
    assert_eq!(state.control.reset_count, 1);
    assert_eq!(store.replay().expect("replay").len(), events_before + 1);
}

/// Two handles on the same file (the loop and the CLI) never reuse ids.
#[test]
fn interleaved_writers_keep_ids_unique() {
    let temp = tempfile::tempdir().expect("tempdir");
    let loop_side = open(temp.path(), "demo");
    let cli_side = open(temp.path(), "demo");

    for i in 0..5 {
        loop_side.iteration_started(i + 1).expect("loop append");
        cli_side
            .add_note(NoteKind::Learning, &format!("note {i}"))
            .expect("cli append");
    }

    let ids: Vec<u64> = loop_side
        .replay()
        .expect("replay")
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
}
