//! Loop-level scenarios: the orchestrator driven through several iterations
//! with a scripted runner, scripted hooks and an in-memory session log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentloop::acp::{RunnerError, RunnerEvent};
use agentloop::core::types::TaskStatus;
use agentloop::io::config::LoopConfig;
use agentloop::io::hooks::HookSpec;
use agentloop::orchestrator::{LoopState, LoopStop, Orchestrator, UiEvent};
use agentloop::test_support::{LoopHarness, ScriptedIteration, ScriptedRunner};

fn config(max_iterations: u32) -> LoopConfig {
    LoopConfig {
        max_iterations,
        ..LoopConfig::default()
    }
}

/// Poll `check` until it holds. Panics after five seconds.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn spawn_run(
    orchestrator: &Arc<Orchestrator>,
) -> tokio::task::JoinHandle<anyhow::Result<agentloop::orchestrator::LoopOutcome>> {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move { orchestrator.run().await })
}

/// Agent finishes the only task and completes the session in iteration 1.
#[tokio::test]
async fn loop_stops_when_session_completes() {
    let harness = LoopHarness::new();
    let task = harness.store.add_task("ship it", 1, &[]).expect("add");
    let store = harness.store.clone();
    let id = task.id.clone();
    let runner = Arc::new(ScriptedRunner::new(
        harness.listener(),
        vec![ScriptedIteration::act(move || {
            store.set_task_status(&id, TaskStatus::Completed).expect("status");
            store.complete().expect("complete");
        })],
    ));
    let mut cfg = config(10);
    cfg.hooks.on_task_complete = vec![HookSpec::piped("notify")];
    cfg.hooks.on_complete = vec![HookSpec::new("celebrate")];
    let orchestrator = harness.orchestrator(cfg, runner.clone());

    let outcome = orchestrator.run().await.expect("run");

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.iterations, 1);
    let record = runner.record();
    assert_eq!(record.iterations.len(), 1);
    assert!(record.iterations[0].0.contains("ship it"));

    let calls = harness.hooks.calls();
    let commands: Vec<&str> = calls.iter().map(|c| c.commands[0].as_str()).collect();
    assert_eq!(commands, vec!["notify", "celebrate"]);
    assert!(!calls[1].piped_only, "completion hooks run all commands");

    let events = harness.ui.events();
    assert!(events.contains(&UiEvent::TaskCompleted {
        id: task.id.clone(),
        content: "ship it".into()
    }));
    assert_eq!(events.last(), Some(&UiEvent::StateChanged(LoopState::Idle)));
    assert!(events.contains(&UiEvent::SessionComplete));
}

/// Pending output is delivered once, ahead of the pre-iteration hook output.
#[tokio::test]
async fn pending_output_reaches_the_next_prompt_once() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()));
    let mut cfg = config(2);
    cfg.hooks.pre_iteration = vec![HookSpec::piped("pre"), HookSpec::new("quiet")];
    cfg.hooks.post_iteration = vec![HookSpec::piped("post")];
    let orchestrator = harness.orchestrator(cfg, runner.clone());
    let handle = orchestrator.handle();
    handle.append_output("x");
    handle.append_output("");
    handle.append_output("y");

    let outcome = orchestrator.run().await.expect("run");

    assert_eq!(outcome.stop, LoopStop::MaxIterations);
    let hook_outputs: Vec<String> = runner
        .record()
        .iterations
        .into_iter()
        .map(|(_, hooks)| hooks)
        .collect();
    assert_eq!(hook_outputs, vec!["x\ny\npre", "post\npre"]);
}

/// Iteration numbers continue across invocations; the limit is per invocation.
#[tokio::test]
async fn iteration_numbers_continue_across_runs() {
    let harness = LoopHarness::new();
    for _ in 0..2 {
        let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()));
        let orchestrator = harness.orchestrator(config(2), runner.clone());
        let outcome = orchestrator.run().await.expect("run");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(runner.record().starts, 1);
    }

    let state = harness.store.state().expect("state");
    assert_eq!(state.control.last_iteration, 4);
    let started: Vec<u32> = harness
        .ui
        .events()
        .iter()
        .filter_map(|event| match event {
            UiEvent::IterationStarted { iteration } => Some(*iteration),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![1, 2, 3, 4]);
}

/// Failures run error hooks, feed their output forward, and restart the agent.
#[tokio::test]
async fn repeated_failures_restart_the_agent() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(
        harness.listener(),
        vec![
            ScriptedIteration::Fail(RunnerError::Connection("gone".into())),
            ScriptedIteration::Fail(RunnerError::Connection("gone again".into())),
            ScriptedIteration::ok(),
        ],
    ));
    let mut cfg = config(3);
    cfg.restart_after_errors = 2;
    cfg.hooks.on_error = vec![HookSpec::piped("triage")];
    let orchestrator = harness.orchestrator(cfg, runner.clone());

    let outcome = orchestrator.run().await.expect("failures are not fatal");

    assert_eq!(outcome.iterations, 3);
    let record = runner.record();
    assert_eq!(record.starts, 2);
    assert_eq!(record.stops, 1);
    assert_eq!(record.iterations[1].1, "triage");

    let calls = harness.hooks.calls();
    assert_eq!(
        calls[0].vars.error.as_deref(),
        Some("agent connection closed: gone")
    );
    assert!(harness.ui.notices().iter().any(|n| n.contains("restarting agent")));
    assert_eq!(harness.store.state().expect("state").control.last_error, None);
}

/// A panicking runner is recorded as a failed iteration and the loop continues.
#[tokio::test]
async fn runner_panic_is_contained() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(
        harness.listener(),
        vec![ScriptedIteration::Panic("boom"), ScriptedIteration::ok()],
    ));
    let orchestrator = harness.orchestrator(config(2), runner.clone());

    let outcome = orchestrator.run().await.expect("run");

    assert_eq!(outcome.iterations, 2);
    let failure = harness
        .store
        .replay()
        .expect("replay")
        .into_iter()
        .find(|event| event.action == "iteration_error")
        .expect("failure recorded");
    assert!(failure.meta["error"].as_str().unwrap_or_default().contains("boom"));
    assert!(harness.ui.events().iter().any(|event| matches!(
        event,
        UiEvent::IterationFinished { iteration: 1, error: Some(err), .. } if err.contains("panicked")
    )));
}

/// Stop cancels a blocked iteration; concurrent and repeated stops tear down once.
#[tokio::test]
async fn stop_cancels_a_running_iteration() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(
        harness.listener(),
        vec![ScriptedIteration::WaitForCancel],
    ));
    let orchestrator = Arc::new(harness.orchestrator(config(0), runner.clone()));
    let handle = orchestrator.handle();
    let run = spawn_run(&orchestrator);
    eventually("first iteration", || runner.record().iterations.len() == 1).await;

    let stops: Vec<_> = (0..3)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.stop().await })
        })
        .collect();
    for stop in stops {
        stop.await.expect("join");
    }
    handle.stop().await;

    let outcome = run.await.expect("join").expect("run");
    assert_eq!(outcome.stop, LoopStop::Cancelled);
    assert_eq!(runner.record().stops, 1);
    assert_eq!(handle.state(), LoopState::Stopped);
    assert!(harness.store.add_task("late", 2, &[]).is_err(), "store closed");
}

#[tokio::test]
async fn stop_before_run_is_safe() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()));
    let orchestrator = harness.orchestrator(config(0), runner.clone());

    orchestrator.stop().await;
    orchestrator.stop().await;
    let outcome = orchestrator.run().await.expect("run");

    assert_eq!(outcome.stop, LoopStop::Cancelled);
    assert_eq!(outcome.iterations, 0);
    assert_eq!(runner.record().starts, 0);
    assert_eq!(runner.record().stops, 1);
}

/// Pause holds the loop between iterations until resumed.
#[tokio::test]
async fn pause_holds_the_loop_until_resume() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()));
    let orchestrator = Arc::new(harness.orchestrator(config(2), runner.clone()));
    let handle = orchestrator.handle();
    handle.pause().expect("pause");

    let run = spawn_run(&orchestrator);
    eventually("paused", || handle.state() == LoopState::Paused).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(runner.record().iterations.len(), 1);

    handle.resume().expect("resume");
    let outcome = run.await.expect("join").expect("run");
    assert_eq!(outcome.stop, LoopStop::MaxIterations);
    assert_eq!(runner.record().iterations.len(), 2);
}

#[tokio::test]
async fn user_messages_go_to_the_agent_session() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()));
    let orchestrator = harness.orchestrator(config(2), runner.clone());
    orchestrator.handle().send_message("try the other crate");
    orchestrator.handle().send_message("  ");

    orchestrator.run().await.expect("run");

    let record = runner.record();
    assert_eq!(record.messages, vec![vec!["try the other crate".to_string()]]);
    assert_eq!(record.iterations[1].1, "");
}

/// Messages the agent cannot take are delivered with the next prompt instead.
#[tokio::test]
async fn undeliverable_messages_fall_back_to_the_next_prompt() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()).failing_messages());
    let orchestrator = harness.orchestrator(config(2), runner.clone());
    orchestrator.handle().send_message("hello");

    orchestrator.run().await.expect("run");

    assert_eq!(runner.record().iterations[1].1, "hello");
    assert!(harness.ui.notices().iter().any(|n| n.contains("deferred")));
}

#[tokio::test]
async fn auto_commit_only_after_file_changes() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(
        harness.listener(),
        vec![
            ScriptedIteration::events(vec![RunnerEvent::FileChange(PathBuf::from("src/lib.rs"))]),
            ScriptedIteration::ok(),
        ],
    ));
    let mut cfg = config(2);
    cfg.auto_commit = true;
    let orchestrator = harness.orchestrator(cfg, runner);

    orchestrator.run().await.expect("run");

    assert_eq!(harness.committer.commits(), vec![("test".to_string(), 1)]);
    assert!(harness.ui.events().contains(&UiEvent::Committed { iteration: 1 }));
}

/// Completion hooks fire once per task, and their output reaches the next prompt.
#[tokio::test]
async fn task_completion_hooks_fire_once() {
    let harness = LoopHarness::new();
    let done = harness.store.add_task("done already", 2, &[]).expect("add");
    harness
        .store
        .set_task_status(&done.id, TaskStatus::Completed)
        .expect("status");
    let task = harness.store.add_task("finish me", 2, &[]).expect("add");
    let store = harness.store.clone();
    let runner = Arc::new(ScriptedRunner::new(
        harness.listener(),
        vec![ScriptedIteration::act(move || {
            store
                .set_task_status(&task.id, TaskStatus::Completed)
                .expect("status");
        })],
    ));
    let mut cfg = config(3);
    cfg.hooks.on_task_complete = vec![HookSpec::piped("notify")];
    let orchestrator = harness.orchestrator(cfg, runner.clone());

    orchestrator.run().await.expect("run");

    let calls = harness.hooks.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].vars.task_content.as_deref(), Some("finish me"));
    let record = runner.record();
    assert_eq!(record.iterations[1].1, "notify");
    assert_eq!(record.iterations[2].1, "");
}

#[tokio::test]
async fn reset_request_clears_the_projection() {
    let harness = LoopHarness::new();
    harness.store.add_task("stale", 2, &[]).expect("add");
    let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()));
    let orchestrator = harness.orchestrator(config(1), runner);
    orchestrator.handle().request_reset();

    orchestrator.run().await.expect("run");

    let state = harness.store.state().expect("state");
    assert!(state.tasks.is_empty());
    assert_eq!(state.control.reset_count, 1);
}

#[tokio::test]
async fn failed_start_is_an_error() {
    let harness = LoopHarness::new();
    let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()).failing_start());
    let orchestrator = harness.orchestrator(config(1), runner.clone());

    let err = orchestrator.run().await.expect_err("start fails");
    assert!(format!("{err:#}").contains("agent binary missing"));
    assert!(runner.record().iterations.is_empty());
}

#[tokio::test]
async fn completed_session_runs_no_iterations() {
    let harness = LoopHarness::new();
    harness.store.complete().expect("empty session completes");
    let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()));
    let orchestrator = harness.orchestrator(config(5), runner.clone());

    let outcome = orchestrator.run().await.expect("run");

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.iterations, 0);
    assert_eq!(runner.record().starts, 0);
}
