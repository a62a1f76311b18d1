//! The iteration loop.
//!
//! Each iteration: record the start, gather hook and pending text, build the
//! prompt from the session projection, run one agent session, record the
//! outcome, then run post-iteration work (hooks, task-completion hooks,
//! auto-commit, queued user messages) before checking for completion, pause
//! and cancellation.
//!
//! The loop is single-threaded control flow. Everything that can be touched
//! from other tasks (pending output, pause flag, queued messages) lives in
//! [`OrchestratorHandle`]'s shared state and is internally synchronized.

pub mod pending;
pub mod ui;

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::acp::{IterationOutcome, Runner, StopReason};
use crate::core::types::{Task, TaskStatus};
use crate::io::config::LoopConfig;
use crate::io::git::Committer;
use crate::io::hooks::{HookExecutor, HookSpec, HookVars};
use crate::io::prompt::PromptBuilder;
use crate::store::SessionStore;

pub use pending::{PendingOutput, join_segments};
pub use ui::{ConsoleUi, LoopListener, LoopState, UiEvent, UiSink};

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// The session reported `complete`.
    Complete,
    /// `max_iterations` iterations ran.
    MaxIterations,
    /// Stopped or cancelled.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Iterations started by this `run` call.
    pub iterations: u32,
    pub stop: LoopStop,
}

/// Collaborators wired into an [`Orchestrator`].
///
/// `listener` must be the listener the runner was built with; the loop reads
/// file changes from it for auto-commit.
pub struct OrchestratorParts {
    pub config: LoopConfig,
    pub store: SessionStore,
    pub runner: Arc<dyn Runner>,
    pub hooks: Arc<dyn HookExecutor>,
    pub ui: Arc<dyn UiSink>,
    pub listener: Arc<LoopListener>,
    pub committer: Option<Arc<dyn Committer>>,
}

enum Step {
    Continue { failed: bool },
    Complete,
    Cancelled,
}

struct Inner {
    config: LoopConfig,
    store: SessionStore,
    runner: Arc<dyn Runner>,
    hooks: Arc<dyn HookExecutor>,
    ui: Arc<dyn UiSink>,
    listener: Arc<LoopListener>,
    committer: Option<Arc<dyn Committer>>,
    prompt: PromptBuilder,
    pending: PendingOutput,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    state: watch::Sender<LoopState>,
    messages: Mutex<Vec<String>>,
    reset_requested: AtomicBool,
    /// Held by `run` for the whole loop; `stop` acquires it to wait the loop out.
    running: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
    /// Task ids whose completion hooks already ran.
    hooked_tasks: Mutex<HashSet<String>>,
}

/// Drives iterations until the session completes, the iteration limit is
/// reached, or the loop is stopped.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Cloneable control surface for the UI layer and other tasks.
#[derive(Clone)]
pub struct OrchestratorHandle {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Result<Self> {
        let prompt = PromptBuilder::new(parts.config.prompt.clone())?;
        let (paused, _) = watch::channel(false);
        let (state, _) = watch::channel(LoopState::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                config: parts.config,
                store: parts.store,
                runner: parts.runner,
                hooks: parts.hooks,
                ui: parts.ui,
                listener: parts.listener,
                committer: parts.committer,
                prompt,
                pending: PendingOutput::new(),
                cancel: CancellationToken::new(),
                paused,
                state,
                messages: Mutex::new(Vec::new()),
                reset_requested: AtomicBool::new(false),
                running: tokio::sync::Mutex::new(()),
                stopped: AtomicBool::new(false),
                hooked_tasks: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Run the loop. Only one `run` may be active at a time.
    #[instrument(skip_all, fields(session = %self.inner.config.session))]
    pub async fn run(&self) -> Result<LoopOutcome> {
        let inner = &self.inner;
        let Ok(_running) = inner.running.try_lock() else {
            bail!("the loop is already running");
        };
        let cancelled = LoopOutcome {
            iterations: 0,
            stop: LoopStop::Cancelled,
        };
        if inner.stopped.load(Ordering::SeqCst) || inner.cancel.is_cancelled() {
            return Ok(cancelled);
        }

        let initial = inner.store.state().context("load session state")?;
        if initial.control.complete {
            info!("session already complete");
            return Ok(LoopOutcome {
                iterations: 0,
                stop: LoopStop::Complete,
            });
        }
        for task in initial.tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
            inner.claim_task(&task.id);
        }

        inner.set_state(LoopState::Running);
        if let Err(err) = inner.runner.start(&inner.cancel).await {
            if inner.cancel.is_cancelled() {
                return Ok(cancelled);
            }
            inner.set_state(LoopState::Idle);
            return Err(anyhow::Error::new(err).context("start agent"));
        }

        let mut iteration = initial.control.last_iteration;
        let mut ran = 0u32;
        let mut consecutive_errors = 0u32;
        let stop = loop {
            if inner.cancel.is_cancelled() {
                break LoopStop::Cancelled;
            }
            if inner.config.max_iterations > 0 && ran >= inner.config.max_iterations {
                break LoopStop::MaxIterations;
            }
            iteration += 1;
            ran += 1;

            match inner.iterate(iteration).await? {
                Step::Cancelled => break LoopStop::Cancelled,
                Step::Complete => break LoopStop::Complete,
                Step::Continue { failed: false } => consecutive_errors = 0,
                Step::Continue { failed: true } => {
                    consecutive_errors += 1;
                    let limit = inner.config.restart_after_errors;
                    if limit > 0 && consecutive_errors >= limit {
                        inner.restart_runner(consecutive_errors).await;
                        consecutive_errors = 0;
                    }
                }
            }

            inner.apply_reset();
            inner.deliver_messages().await;
            inner.wait_while_paused().await;
        };

        if stop != LoopStop::Cancelled {
            inner.set_state(LoopState::Idle);
        }
        info!(iterations = ran, stop = ?stop, "loop finished");
        Ok(LoopOutcome {
            iterations: ran,
            stop,
        })
    }

    /// See [`OrchestratorHandle::stop`].
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// See [`OrchestratorHandle::task_completed`].
    pub async fn task_completed(&self, task_id: &str) -> Result<bool> {
        self.inner.task_completed(task_id).await
    }
}

impl OrchestratorHandle {
    /// Pause after the current iteration.
    pub fn pause(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.paused.send_replace(true) {
            return Ok(());
        }
        info!("pause requested");
        inner.store.pause().map(drop).context("record pause")
    }

    pub fn resume(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.paused.send_replace(false) {
            return Ok(());
        }
        info!("resume requested");
        inner.store.resume().map(drop).context("record resume")
    }

    /// Queue a user message for the current agent session.
    pub fn send_message(&self, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        lock(&self.inner.messages).push(text);
    }

    /// Reset the session projection at the next iteration boundary.
    pub fn request_reset(&self) {
        self.inner.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Queue text for the next prompt.
    pub fn append_output(&self, text: &str) {
        self.inner.pending.append(text);
    }

    pub fn state(&self) -> LoopState {
        *self.inner.state.borrow()
    }

    /// Cancel the loop, wait for it to return, then stop the runner and close
    /// the store. Safe to call any number of times, concurrently, and before
    /// the loop ever ran.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Run completion hooks for a task completed outside the loop's own check.
    /// Returns `false` if the task was already hooked.
    pub async fn task_completed(&self, task_id: &str) -> Result<bool> {
        self.inner.task_completed(task_id).await
    }
}

impl Inner {
    fn set_state(&self, state: LoopState) {
        if self.state.send_replace(state) != state {
            self.ui.emit(UiEvent::StateChanged(state));
        }
    }

    fn notice(&self, text: String) {
        self.ui.emit(UiEvent::Notice(text));
    }

    fn vars(&self, iteration: u32) -> HookVars {
        HookVars {
            session: self.config.session.clone(),
            iteration,
            ..HookVars::default()
        }
    }

    fn claim_task(&self, id: &str) -> bool {
        lock(&self.hooked_tasks).insert(id.to_string())
    }

    #[instrument(skip_all, fields(iteration = iteration))]
    async fn iterate(&self, iteration: u32) -> Result<Step> {
        self.listener.reset_changes();
        if let Err(err) = self.store.iteration_started(iteration) {
            warn!(err = %format!("{err:#}"), "failed to record iteration start");
        }
        self.ui.emit(UiEvent::IterationStarted { iteration });
        let vars = self.vars(iteration);

        let pre = self
            .run_hooks("pre_iteration", &self.config.hooks.pre_iteration, &vars)
            .await;
        let pending = self.pending.drain();
        let hook_output = join_segments([pending.as_str(), pre.as_str()]);

        let state = self.store.state().context("rebuild session state")?;
        let prompt = self
            .prompt
            .build(&self.config.session, iteration, &state)
            .context("build prompt")?;
        debug!(prompt_bytes = prompt.len(), hook_bytes = hook_output.len(), "prompt ready");

        let started = Instant::now();
        let result = AssertUnwindSafe(self.runner.run_iteration(&self.cancel, &prompt, &hook_output))
            .catch_unwind()
            .await;
        let result: Result<IterationOutcome, String> = match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(err.to_string()),
            Err(panic) => Err(format!("agent iteration panicked: {}", panic_message(&*panic))),
        };

        let failed = match result {
            Ok(outcome) => {
                self.record_finished(iteration, outcome.stop_reason, outcome.duration);
                if outcome.stop_reason == StopReason::Cancelled && self.cancel.is_cancelled() {
                    return Ok(Step::Cancelled);
                }
                false
            }
            Err(_) if self.cancel.is_cancelled() => {
                self.record_finished(iteration, StopReason::Cancelled, started.elapsed());
                return Ok(Step::Cancelled);
            }
            Err(message) => {
                warn!(err = %message, "iteration failed");
                if let Err(err) = self.store.iteration_failed(iteration, &message) {
                    warn!(err = %format!("{err:#}"), "failed to record iteration error");
                }
                self.ui.emit(UiEvent::IterationFinished {
                    iteration,
                    stop_reason: StopReason::Error,
                    duration: started.elapsed(),
                    error: Some(message.clone()),
                });
                let error_vars = HookVars {
                    error: Some(message),
                    ..vars.clone()
                };
                let out = self
                    .run_hooks("on_error", &self.config.hooks.on_error, &error_vars)
                    .await;
                self.pending.append(&out);
                true
            }
        };

        let post = self
            .run_hooks("post_iteration", &self.config.hooks.post_iteration, &vars)
            .await;
        self.pending.append(&post);

        let state = self.store.state().context("rebuild session state")?;
        for task in state.tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
            self.hook_completed_task(task, iteration).await;
        }

        self.auto_commit(iteration).await;

        if state.control.complete {
            info!("session complete");
            let out = self
                .run_hooks_all("on_complete", &self.config.hooks.on_complete, &vars)
                .await;
            if !out.is_empty() {
                self.notice(out);
            }
            self.ui.emit(UiEvent::SessionComplete);
            return Ok(Step::Complete);
        }
        Ok(Step::Continue { failed })
    }

    fn record_finished(
        &self,
        iteration: u32,
        stop_reason: StopReason,
        duration: std::time::Duration,
    ) {
        if let Err(err) = self
            .store
            .iteration_completed(iteration, stop_reason.as_str(), duration)
        {
            warn!(err = %format!("{err:#}"), "failed to record iteration completion");
        }
        self.ui.emit(UiEvent::IterationFinished {
            iteration,
            stop_reason,
            duration,
            error: None,
        });
    }

    /// Run hooks and return the output meant for the agent. Failures become text.
    async fn run_hooks(&self, point: &str, hooks: &[HookSpec], vars: &HookVars) -> String {
        if hooks.is_empty() {
            return String::new();
        }
        match self
            .hooks
            .execute_piped(&self.cancel, hooks, &self.config.workdir, vars)
            .await
        {
            Ok(out) => out,
            Err(err) => self.hook_failure(point, &err),
        }
    }

    async fn run_hooks_all(&self, point: &str, hooks: &[HookSpec], vars: &HookVars) -> String {
        if hooks.is_empty() {
            return String::new();
        }
        match self
            .hooks
            .execute_all(&self.cancel, hooks, &self.config.workdir, vars)
            .await
        {
            Ok(out) => out,
            Err(err) => self.hook_failure(point, &err),
        }
    }

    fn hook_failure(&self, point: &str, err: &anyhow::Error) -> String {
        warn!(point, err = %format!("{err:#}"), "hooks failed");
        let text = format!("[{point} hooks failed: {err:#}]");
        self.notice(text.clone());
        text
    }

    async fn hook_completed_task(&self, task: &Task, iteration: u32) -> bool {
        if !self.claim_task(&task.id) {
            return false;
        }
        info!(task_id = %task.id, "task completed");
        self.ui.emit(UiEvent::TaskCompleted {
            id: task.id.clone(),
            content: task.content.clone(),
        });
        let vars = HookVars {
            task_id: Some(task.id.clone()),
            task_content: Some(task.content.clone()),
            ..self.vars(iteration)
        };
        let out = self
            .run_hooks("on_task_complete", &self.config.hooks.on_task_complete, &vars)
            .await;
        self.pending.append(&out);
        true
    }

    async fn task_completed(&self, task_id: &str) -> Result<bool> {
        let state = self.store.state().context("load session state")?;
        let task = state
            .task(task_id)
            .ok_or_else(|| anyhow!("unknown task '{task_id}'"))?;
        if task.status != TaskStatus::Completed {
            bail!("task '{task_id}' is {}, not completed", task.status);
        }
        Ok(self
            .hook_completed_task(task, state.control.last_iteration)
            .await)
    }

    async fn auto_commit(&self, iteration: u32) {
        let changes = self.listener.take_changes();
        if !self.config.auto_commit || changes.is_empty() {
            return;
        }
        let Some(committer) = self.committer.clone() else {
            return;
        };
        debug!(files = changes.len(), "auto-committing");
        let session = self.config.session.clone();
        match tokio::task::spawn_blocking(move || committer.commit(&session, iteration)).await {
            Ok(Ok(true)) => self.ui.emit(UiEvent::Committed { iteration }),
            Ok(Ok(false)) => debug!("nothing to commit"),
            Ok(Err(err)) => {
                warn!(err = %format!("{err:#}"), "auto-commit failed");
                self.notice(format!("auto-commit failed: {err:#}"));
            }
            Err(err) => warn!(err = %err, "auto-commit task failed"),
        }
    }

    async fn restart_runner(&self, consecutive_errors: u32) {
        warn!(consecutive_errors, "restarting agent after repeated failures");
        self.notice(format!(
            "restarting agent after {consecutive_errors} consecutive failed iterations"
        ));
        self.runner.stop().await;
        if let Err(err) = self.runner.start(&self.cancel).await {
            warn!(err = %err, "agent restart failed");
            self.notice(format!("agent restart failed: {err}"));
        }
    }

    fn apply_reset(&self) {
        if !self.reset_requested.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.store.reset() {
            Ok(_) => {
                lock(&self.hooked_tasks).clear();
                let dropped = self.pending.drain();
                debug!(dropped_bytes = dropped.len(), "pending output cleared by reset");
                self.notice("session reset".to_string());
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "reset failed");
                self.notice(format!("reset failed: {err:#}"));
            }
        }
    }

    /// Forward queued user messages; anything undeliverable goes to the next prompt.
    async fn deliver_messages(&self) {
        let messages = std::mem::take(&mut *lock(&self.messages));
        if messages.is_empty() || self.cancel.is_cancelled() {
            for message in &messages {
                self.pending.append(message);
            }
            return;
        }
        if let Err(err) = self.runner.send_messages(&self.cancel, &messages).await {
            warn!(err = %err, count = messages.len(), "deferring user messages");
            self.notice(format!("user messages deferred to the next iteration: {err}"));
            for message in &messages {
                self.pending.append(message);
            }
        }
    }

    async fn wait_while_paused(&self) {
        let mut paused = self.paused.subscribe();
        let mut waited = false;
        loop {
            let is_paused = *paused.borrow_and_update();
            if !is_paused || self.cancel.is_cancelled() {
                break;
            }
            if !waited {
                info!("loop paused");
                self.set_state(LoopState::Paused);
                waited = true;
            }
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = self.cancel.cancelled() => break,
            }
        }
        if waited && !self.cancel.is_cancelled() {
            info!("loop resumed");
            self.set_state(LoopState::Running);
        }
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let _running = self.running.lock().await;
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.runner.stop().await;
        if let Err(err) = self.store.close() {
            warn!(err = %format!("{err:#}"), "failed to close store");
        }
        self.set_state(LoopState::Stopped);
        info!("orchestrator stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LoopHarness, ScriptedIteration, ScriptedRunner};

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*boxed), "unknown panic");
    }

    /// Pause and resume toggle only once and are recorded as control events.
    #[tokio::test]
    async fn pause_and_resume_are_recorded_once() {
        let harness = LoopHarness::new();
        let runner = Arc::new(ScriptedRunner::new(harness.listener(), Vec::new()));
        let orchestrator = harness.orchestrator(LoopConfig::default(), runner);
        let handle = orchestrator.handle();

        handle.pause().expect("pause");
        handle.pause().expect("pause again");
        assert!(harness.store.state().expect("state").control.paused);
        handle.resume().expect("resume");
        handle.resume().expect("resume again");

        let actions: Vec<String> = harness
            .store
            .replay()
            .expect("replay")
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["pause", "resume"]);
    }

    /// Completion hooks run once per task whether triggered directly or by the loop.
    #[tokio::test]
    async fn task_completed_hooks_each_task_once() {
        let harness = LoopHarness::new();
        let mut config = LoopConfig::default();
        config.hooks.on_task_complete = vec![HookSpec::piped("notify")];
        let runner = Arc::new(ScriptedRunner::new(
            harness.listener(),
            vec![ScriptedIteration::ok()],
        ));
        let orchestrator = harness.orchestrator(config, runner);
        let task = harness.store.add_task("ship", 2, &[]).expect("add");

        let err = orchestrator
            .task_completed(&task.id)
            .await
            .expect_err("not completed yet");
        assert!(err.to_string().contains("not completed"));

        harness
            .store
            .set_task_status(&task.id, TaskStatus::Completed)
            .expect("status");
        assert!(orchestrator.task_completed(&task.id).await.expect("hooked"));
        assert!(!orchestrator.task_completed(&task.id).await.expect("already hooked"));

        let calls = harness.hooks.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].vars.task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(calls[0].vars.task_content.as_deref(), Some("ship"));
    }
}
