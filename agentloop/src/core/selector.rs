//! Deterministic task selection over the dependency graph.

use crate::core::types::{SessionState, Task, TaskStatus};

/// True if every dependency of `task` maps to a `completed` task.
///
/// A dependency on an id that does not exist keeps the task blocked forever.
/// Cycles are not detected; tasks on a cycle simply never become unblocked.
pub fn is_unblocked(state: &SessionState, task: &Task) -> bool {
    task.dependencies.iter().all(|dep| {
        state
            .task(dep)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    })
}

/// Pick the next actionable task.
///
/// Among `remaining` tasks whose dependencies are all completed, returns the one
/// with the highest priority; ties go to the earliest created. Returns `None`
/// when nothing is eligible.
pub fn next_task(state: &SessionState) -> Option<&Task> {
    state
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Remaining && is_unblocked(state, task))
        .fold(None, |best: Option<&Task>, task| match best {
            Some(current)
                if (current.priority, std::cmp::Reverse(current.created_seq))
                    >= (task.priority, std::cmp::Reverse(task.created_seq)) =>
            {
                Some(current)
            }
            _ => Some(task),
        })
}

/// Remaining tasks that cannot run because of an incomplete or unknown dependency.
pub fn blocked_tasks(state: &SessionState) -> Vec<&Task> {
    state
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Remaining && !is_unblocked(state, task))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::projection::project;
    use crate::test_support::{EventBuilder, task_add, task_status};

    /// A (p2) gates B (p4): A is picked first, then B once A completes.
    #[test]
    fn dependency_gates_higher_priority_task() {
        let mut log = EventBuilder::new("s");
        let mut events = vec![
            log.push(task_add("a", "A", 2, &[])),
            log.push(task_add("b", "B", 4, &["a"])),
        ];

        let state = project(&events);
        assert_eq!(next_task(&state).map(|t| t.id.as_str()), Some("a"));

        events.push(log.push(task_status("a", TaskStatus::Completed)));
        let state = project(&events);
        assert_eq!(next_task(&state).map(|t| t.id.as_str()), Some("b"));
    }

    #[test]
    fn ties_break_by_creation_order() {
        let mut log = EventBuilder::new("s");
        let events = vec![
            log.push(task_add("low", "low", 1, &[])),
            log.push(task_add("first", "first", 3, &[])),
            log.push(task_add("second", "second", 3, &[])),
        ];

        let state = project(&events);
        assert_eq!(next_task(&state).map(|t| t.id.as_str()), Some("first"));
    }

    /// Only `remaining` tasks are eligible; in-progress and blocked ones are skipped.
    #[test]
    fn skips_non_remaining_tasks() {
        let mut log = EventBuilder::new("s");
        let events = vec![
            log.push(task_add("a", "A", 4, &[])),
            log.push(task_add("b", "B", 4, &[])),
            log.push(task_add("c", "C", 0, &[])),
            log.push(task_status("a", TaskStatus::InProgress)),
            log.push(task_status("b", TaskStatus::Blocked)),
        ];

        let state = project(&events);
        assert_eq!(next_task(&state).map(|t| t.id.as_str()), Some("c"));
    }

    #[test]
    fn unknown_dependency_blocks_permanently() {
        let mut log = EventBuilder::new("s");
        let events = vec![log.push(task_add("a", "A", 4, &["ghost"]))];

        let state = project(&events);
        assert!(next_task(&state).is_none());
        assert_eq!(blocked_tasks(&state).len(), 1);
    }

    /// Tasks that depend on each other are never selected.
    #[test]
    fn cyclic_dependencies_stay_blocked() {
        let mut log = EventBuilder::new("s");
        let events = vec![
            log.push(task_add("a", "A", 1, &["b"])),
            log.push(task_add("b", "B", 1, &["a"])),
        ];

        let state = project(&events);
        assert!(next_task(&state).is_none());
        assert_eq!(blocked_tasks(&state).len(), 2);
    }

    #[test]
    fn empty_state_has_no_next_task() {
        assert!(next_task(&SessionState::default()).is_none());
    }
}
