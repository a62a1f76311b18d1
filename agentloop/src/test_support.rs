//! Test-only helpers: event fixtures and scripted doubles for every seam.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::acp::{
    AgentSpawner, AgentTransport, ContentBlock, FinishEvent, IterationOutcome, McpServer, Runner,
    RunnerError, RunnerEvent, RunnerListener, SessionUpdate, StopReason,
};
use crate::core::types::{Event, EventKind, NewEvent, TaskStatus};
use crate::io::config::LoopConfig;
use crate::io::git::Committer;
use crate::io::hooks::{HookExecutor, HookSpec, HookVars};
use crate::orchestrator::{LoopListener, Orchestrator, OrchestratorParts, UiEvent, UiSink};
use crate::store::SessionStore;
use crate::store::memory::InMemoryEventLog;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Assigns sequential ids to events for reducer tests.
#[derive(Debug)]
pub struct EventBuilder {
    session: String,
    next_id: u64,
}

impl EventBuilder {
    pub fn new(session: &str) -> Self {
        Self {
            session: session.to_string(),
            next_id: 1,
        }
    }

    pub fn push(&mut self, event: NewEvent) -> Event {
        let id = self.next_id;
        self.next_id += 1;
        Event {
            id,
            timestamp: Utc::now(),
            session: self.session.clone(),
            kind: event.kind,
            action: event.action,
            meta: event.meta,
            data: event.data,
        }
    }
}

/// A `task/add` event with an explicit id.
pub fn task_add(id: &str, content: &str, priority: i64, dependencies: &[&str]) -> NewEvent {
    NewEvent::new(EventKind::Task, "add")
        .with_meta(json!({ "id": id, "priority": priority, "dependencies": dependencies }))
        .with_data(content)
}

pub fn task_status(id: &str, status: TaskStatus) -> NewEvent {
    NewEvent::new(EventKind::Task, "status")
        .with_meta(json!({ "id": id, "status": status.as_str() }))
}

/// Session store over a fresh in-memory log.
pub fn memory_store(session: &str) -> SessionStore {
    SessionStore::new(Arc::new(InMemoryEventLog::new()), session).expect("memory store")
}

/// Shared, ordered log of calls made on a double.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    fn push(&self, call: impl Into<String>) {
        lock(&self.calls).push(call.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Wait until `call` has been logged. Panics after five seconds.
    pub async fn wait_for(&self, call: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !lock(&self.calls).iter().any(|logged| logged == call) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for call {call:?}; saw {:?}",
                self.snapshot()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Scripted response to one `session/prompt`.
#[derive(Debug, Clone)]
pub enum ScriptedPrompt {
    Reply {
        updates: Vec<SessionUpdate>,
        stop_reason: StopReason,
    },
    /// Never answers; the caller has to cancel.
    Hang,
    Fail(String),
}

/// In-process [`AgentTransport`] that logs calls and plays back prompts.
///
/// Unscripted prompts answer `end_turn` with no updates.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    calls: CallLog,
    prompts: Mutex<VecDeque<ScriptedPrompt>>,
    fail_initialize: bool,
    fail_new_session: bool,
    sessions: AtomicU32,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    pub fn fail_new_session(mut self) -> Self {
        self.fail_new_session = true;
        self
    }

    pub fn with_prompt(self, prompt: ScriptedPrompt) -> Self {
        lock(&self.prompts).push_back(prompt);
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn initialize(&self) -> Result<(), RunnerError> {
        self.calls.push("initialize");
        if self.fail_initialize {
            return Err(RunnerError::Protocol {
                code: -32603,
                message: "unsupported protocol version".into(),
            });
        }
        Ok(())
    }

    async fn new_session(
        &self,
        _cwd: &Path,
        _mcp_servers: &[McpServer],
    ) -> Result<String, RunnerError> {
        self.calls.push("new_session");
        if self.fail_new_session {
            return Err(RunnerError::Protocol {
                code: -32603,
                message: "session limit reached".into(),
            });
        }
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("sess-{n}"))
    }

    async fn set_model(&self, _session_id: &str, model: &str) -> Result<(), RunnerError> {
        self.calls.push(format!("set_model {model}"));
        Ok(())
    }

    async fn prompt(
        &self,
        _session_id: &str,
        blocks: Vec<ContentBlock>,
        on_update: &(dyn Fn(SessionUpdate) + Send + Sync),
    ) -> Result<StopReason, RunnerError> {
        let texts: Vec<String> = blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.clone(),
                ContentBlock::Other => "<other>".to_string(),
            })
            .collect();
        self.calls.push(format!("prompt {}", texts.join(" | ")));

        let scripted = lock(&self.prompts).pop_front();
        match scripted {
            None => Ok(StopReason::EndTurn),
            Some(ScriptedPrompt::Reply {
                updates,
                stop_reason,
            }) => {
                for update in updates {
                    on_update(update);
                }
                Ok(stop_reason)
            }
            Some(ScriptedPrompt::Hang) => std::future::pending().await,
            Some(ScriptedPrompt::Fail(message)) => Err(RunnerError::Protocol {
                code: -32603,
                message,
            }),
        }
    }

    async fn cancel(&self, _session_id: &str) -> Result<(), RunnerError> {
        self.calls.push("cancel");
        Ok(())
    }

    async fn close(&self) {
        self.calls.push("close");
    }
}

/// Hands out scripted transports in order; spawning past the end fails.
#[derive(Debug, Default)]
pub struct ScriptedSpawner {
    transports: Mutex<VecDeque<ScriptedTransport>>,
}

impl ScriptedSpawner {
    pub fn new(transports: Vec<ScriptedTransport>) -> Self {
        Self {
            transports: Mutex::new(transports.into()),
        }
    }
}

#[async_trait]
impl AgentSpawner for ScriptedSpawner {
    async fn spawn(&self) -> Result<Box<dyn AgentTransport>, RunnerError> {
        let next = lock(&self.transports).pop_front();
        match next {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(RunnerError::Spawn("no scripted transport left".into())),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RunnerEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<RunnerEvent> {
        lock(&self.events).clone()
    }
}

impl RunnerListener for RecordingListener {
    fn on_event(&self, event: RunnerEvent) {
        lock(&self.events).push(event);
    }
}

#[derive(Debug, Default)]
pub struct RecordingUi {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUi {
    pub fn events(&self) -> Vec<UiEvent> {
        lock(&self.events).clone()
    }

    pub fn notices(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                UiEvent::Notice(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

impl UiSink for RecordingUi {
    fn emit(&self, event: UiEvent) {
        lock(&self.events).push(event);
    }
}

/// Scripted behavior for one [`ScriptedRunner::run_iteration`] call.
pub enum ScriptedIteration {
    /// Stream `events`, then finish with `stop_reason`.
    Finish {
        events: Vec<RunnerEvent>,
        stop_reason: StopReason,
    },
    /// Run `action` (typically store mutations an agent would make), then finish.
    Act {
        action: Arc<dyn Fn() + Send + Sync>,
        stop_reason: StopReason,
    },
    Fail(RunnerError),
    Panic(&'static str),
    /// Block until cancelled, then finish `cancelled`.
    WaitForCancel,
}

impl ScriptedIteration {
    pub fn ok() -> Self {
        ScriptedIteration::Finish {
            events: Vec::new(),
            stop_reason: StopReason::EndTurn,
        }
    }

    pub fn act(action: impl Fn() + Send + Sync + 'static) -> Self {
        ScriptedIteration::Act {
            action: Arc::new(action),
            stop_reason: StopReason::EndTurn,
        }
    }

    pub fn events(events: Vec<RunnerEvent>) -> Self {
        ScriptedIteration::Finish {
            events,
            stop_reason: StopReason::EndTurn,
        }
    }
}

/// What a [`ScriptedRunner`] was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerRecord {
    pub starts: u32,
    pub stops: u32,
    /// `(prompt, hook_output)` per iteration.
    pub iterations: Vec<(String, String)>,
    pub messages: Vec<Vec<String>>,
}

/// [`Runner`] double that plays a script of iterations.
///
/// Unscripted iterations finish `end_turn` immediately.
pub struct ScriptedRunner {
    listener: Arc<dyn RunnerListener>,
    script: Mutex<VecDeque<ScriptedIteration>>,
    record: Mutex<RunnerRecord>,
    fail_start: AtomicBool,
    fail_messages: AtomicBool,
}

impl ScriptedRunner {
    pub fn new(listener: Arc<dyn RunnerListener>, script: Vec<ScriptedIteration>) -> Self {
        Self {
            listener,
            script: Mutex::new(script.into()),
            record: Mutex::new(RunnerRecord::default()),
            fail_start: AtomicBool::new(false),
            fail_messages: AtomicBool::new(false),
        }
    }

    pub fn failing_start(self) -> Self {
        self.fail_start.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_messages(self) -> Self {
        self.fail_messages.store(true, Ordering::SeqCst);
        self
    }

    pub fn record(&self) -> RunnerRecord {
        lock(&self.record).clone()
    }

    fn finish(&self, stop_reason: StopReason, error: Option<String>) {
        self.listener.on_event(RunnerEvent::Finish(FinishEvent {
            stop_reason,
            duration: Duration::ZERO,
            error,
        }));
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn start(&self, _cancel: &CancellationToken) -> Result<(), RunnerError> {
        lock(&self.record).starts += 1;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RunnerError::Spawn("agent binary missing".into()));
        }
        Ok(())
    }

    async fn run_iteration(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        hook_output: &str,
    ) -> Result<IterationOutcome, RunnerError> {
        lock(&self.record)
            .iterations
            .push((prompt.to_string(), hook_output.to_string()));
        let next = lock(&self.script).pop_front();
        let stop_reason = match next.unwrap_or_else(ScriptedIteration::ok) {
            ScriptedIteration::Finish {
                events,
                stop_reason,
            } => {
                for event in events {
                    self.listener.on_event(event);
                }
                stop_reason
            }
            ScriptedIteration::Act {
                action,
                stop_reason,
            } => {
                action();
                stop_reason
            }
            ScriptedIteration::Fail(err) => {
                self.finish(StopReason::Error, Some(err.to_string()));
                return Err(err);
            }
            ScriptedIteration::Panic(message) => panic!("{message}"),
            ScriptedIteration::WaitForCancel => {
                cancel.cancelled().await;
                StopReason::Cancelled
            }
        };
        self.finish(stop_reason, None);
        Ok(IterationOutcome {
            stop_reason,
            duration: Duration::ZERO,
        })
    }

    async fn send_messages(
        &self,
        _cancel: &CancellationToken,
        messages: &[String],
    ) -> Result<(), RunnerError> {
        lock(&self.record).messages.push(messages.to_vec());
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(RunnerError::NoSession);
        }
        Ok(())
    }

    async fn stop(&self) {
        lock(&self.record).stops += 1;
    }
}

/// One call into [`ScriptedHooks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCall {
    pub commands: Vec<String>,
    pub piped_only: bool,
    pub vars: HookVars,
}

/// [`HookExecutor`] that echoes hook commands instead of running them.
#[derive(Debug, Default)]
pub struct ScriptedHooks {
    calls: Mutex<Vec<HookCall>>,
    fail: bool,
}

impl ScriptedHooks {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<HookCall> {
        lock(&self.calls).clone()
    }

    fn run(&self, hooks: &[HookSpec], vars: &HookVars, piped_only: bool) -> anyhow::Result<String> {
        lock(&self.calls).push(HookCall {
            commands: hooks.iter().map(|hook| hook.command.clone()).collect(),
            piped_only,
            vars: vars.clone(),
        });
        if self.fail {
            anyhow::bail!("hook runner unavailable");
        }
        Ok(hooks
            .iter()
            .filter(|hook| !piped_only || hook.pipe_output)
            .map(|hook| hook.command.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[async_trait]
impl HookExecutor for ScriptedHooks {
    async fn execute_all(
        &self,
        _cancel: &CancellationToken,
        hooks: &[HookSpec],
        _workdir: &Path,
        vars: &HookVars,
    ) -> anyhow::Result<String> {
        self.run(hooks, vars, false)
    }

    async fn execute_piped(
        &self,
        _cancel: &CancellationToken,
        hooks: &[HookSpec],
        _workdir: &Path,
        vars: &HookVars,
    ) -> anyhow::Result<String> {
        self.run(hooks, vars, true)
    }
}

/// [`Committer`] that records `(session, iteration)` and always commits.
#[derive(Debug, Default)]
pub struct RecordingCommitter {
    commits: Mutex<Vec<(String, u32)>>,
}

impl RecordingCommitter {
    pub fn commits(&self) -> Vec<(String, u32)> {
        lock(&self.commits).clone()
    }
}

impl Committer for RecordingCommitter {
    fn commit(&self, session: &str, iteration: u32) -> anyhow::Result<bool> {
        lock(&self.commits).push((session.to_string(), iteration));
        Ok(true)
    }
}

/// Shared doubles for orchestrator tests.
pub struct LoopHarness {
    pub store: SessionStore,
    pub ui: Arc<RecordingUi>,
    pub hooks: Arc<ScriptedHooks>,
    pub committer: Arc<RecordingCommitter>,
    listener: Arc<LoopListener>,
}

impl Default for LoopHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopHarness {
    pub fn new() -> Self {
        Self::with_hooks(ScriptedHooks::default())
    }

    pub fn with_hooks(hooks: ScriptedHooks) -> Self {
        let ui = Arc::new(RecordingUi::default());
        let ui_sink: Arc<dyn UiSink> = ui.clone();
        Self {
            store: memory_store("test"),
            listener: Arc::new(LoopListener::new(ui_sink)),
            ui,
            hooks: Arc::new(hooks),
            committer: Arc::new(RecordingCommitter::default()),
        }
    }

    /// The listener a runner double should report to.
    pub fn listener(&self) -> Arc<dyn RunnerListener> {
        self.listener.clone()
    }

    pub fn orchestrator(&self, mut config: LoopConfig, runner: Arc<dyn Runner>) -> Orchestrator {
        config.session = self.store.session().to_string();
        Orchestrator::new(OrchestratorParts {
            config,
            store: self.store.clone(),
            runner,
            hooks: self.hooks.clone(),
            ui: self.ui.clone(),
            listener: Arc::clone(&self.listener),
            committer: Some(self.committer.clone()),
        })
        .expect("orchestrator")
    }
}
