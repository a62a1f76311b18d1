//! [`AcpRunner`]: one long-lived agent process, a fresh ACP session per iteration.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::acp::events::{FinishEvent, IterationOutcome, RunnerEvent, StopReason};
use crate::acp::protocol::{ContentBlock, McpServer, SessionUpdate, runner_events};
use crate::acp::{AgentSpawner, AgentTransport, Runner, RunnerError, RunnerListener};

/// Per-session settings applied on every iteration.
#[derive(Debug, Clone, Default)]
pub struct AcpRunnerConfig {
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub mcp_servers: Vec<McpServer>,
}

struct Connected {
    transport: Box<dyn AgentTransport>,
    session: std::sync::Mutex<Option<String>>,
    in_flight: Mutex<()>,
}

impl Connected {
    fn current_session(&self) -> Option<String> {
        self.session.lock().ok().and_then(|session| session.clone())
    }

    fn set_session(&self, id: &str) {
        if let Ok(mut session) = self.session.lock() {
            *session = Some(id.to_string());
        }
    }
}

enum Lifecycle {
    NotStarted,
    Started(Arc<Connected>),
    Stopped,
}

/// Runner speaking ACP to a spawned agent.
///
/// Lifecycle is `NotStarted -> Started -> Stopped`; a stopped runner may be
/// started again, which spawns a new process. One request is in flight at a
/// time; a second concurrent call fails with [`RunnerError::Busy`].
pub struct AcpRunner {
    spawner: Arc<dyn AgentSpawner>,
    listener: Arc<dyn RunnerListener>,
    config: AcpRunnerConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl AcpRunner {
    pub fn new(
        spawner: Arc<dyn AgentSpawner>,
        listener: Arc<dyn RunnerListener>,
        config: AcpRunnerConfig,
    ) -> Self {
        Self {
            spawner,
            listener,
            config,
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    pub async fn is_started(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Started(_))
    }

    async fn connected(&self) -> Result<Arc<Connected>, RunnerError> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Started(conn) => Ok(Arc::clone(conn)),
            Lifecycle::NotStarted | Lifecycle::Stopped => Err(RunnerError::NotStarted),
        }
    }

    async fn drive_iteration(
        &self,
        conn: &Connected,
        cancel: &CancellationToken,
        prompt: &str,
        hook_output: &str,
    ) -> Result<StopReason, RunnerError> {
        let session = cancellable(
            cancel,
            conn.transport
                .new_session(&self.config.cwd, &self.config.mcp_servers),
        )
        .await;
        let session_id = match session {
            None => return Ok(StopReason::Cancelled),
            Some(result) => result.map_err(|err| RunnerError::SessionCreate(Box::new(err)))?,
        };
        conn.set_session(&session_id);
        debug!(session_id = %session_id, "agent session created");

        if let Some(model) = &self.config.model {
            match cancellable(cancel, conn.transport.set_model(&session_id, model)).await {
                None => return Ok(StopReason::Cancelled),
                Some(result) => result.map_err(|err| RunnerError::ModelSet(Box::new(err)))?,
            }
        }

        let mut blocks = Vec::with_capacity(2);
        if !hook_output.trim().is_empty() {
            blocks.push(ContentBlock::text(hook_output));
        }
        blocks.push(ContentBlock::text(prompt));
        self.prompt(conn, cancel, &session_id, blocks).await
    }

    async fn prompt(
        &self,
        conn: &Connected,
        cancel: &CancellationToken,
        session_id: &str,
        blocks: Vec<ContentBlock>,
    ) -> Result<StopReason, RunnerError> {
        let listener = Arc::clone(&self.listener);
        let on_update = move |update: SessionUpdate| {
            for event in runner_events(update) {
                listener.on_event(event);
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if let Err(err) = conn.transport.cancel(session_id).await {
                    warn!(err = %err, "failed to send session/cancel");
                }
                info!(session_id, "prompt cancelled");
                Ok(StopReason::Cancelled)
            }
            result = conn.transport.prompt(session_id, blocks, &on_update) => {
                result.map_err(|err| RunnerError::Prompt(Box::new(err)))
            }
        }
    }

    fn finish(&self, stop_reason: StopReason, duration: std::time::Duration, error: Option<String>) {
        self.listener.on_event(RunnerEvent::Finish(FinishEvent {
            stop_reason,
            duration,
            error,
        }));
    }
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        value = fut => Some(value),
    }
}

#[async_trait]
impl Runner for AcpRunner {
    #[instrument(skip_all)]
    async fn start(&self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Started(_)) {
            return Ok(());
        }

        let transport = cancellable(cancel, self.spawner.spawn())
            .await
            .ok_or_else(|| RunnerError::Spawn("start cancelled".into()))??;

        let handshake = cancellable(cancel, transport.initialize())
            .await
            .unwrap_or_else(|| Err(RunnerError::Connection("start cancelled".into())));
        if let Err(err) = handshake {
            warn!(err = %err, "agent handshake failed");
            transport.close().await;
            return Err(RunnerError::Handshake(Box::new(err)));
        }

        *lifecycle = Lifecycle::Started(Arc::new(Connected {
            transport,
            session: std::sync::Mutex::new(None),
            in_flight: Mutex::new(()),
        }));
        info!("runner started");
        Ok(())
    }

    #[instrument(skip_all, fields(prompt_bytes = prompt.len(), hook_bytes = hook_output.len()))]
    async fn run_iteration(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        hook_output: &str,
    ) -> Result<IterationOutcome, RunnerError> {
        let conn = self.connected().await?;
        let Ok(_in_flight) = conn.in_flight.try_lock() else {
            return Err(RunnerError::Busy);
        };

        let started = Instant::now();
        let result = self.drive_iteration(&conn, cancel, prompt, hook_output).await;
        let duration = started.elapsed();
        match result {
            Ok(stop_reason) => {
                self.finish(stop_reason, duration, None);
                Ok(IterationOutcome {
                    stop_reason,
                    duration,
                })
            }
            Err(err) => {
                self.finish(StopReason::Error, duration, Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn send_messages(
        &self,
        cancel: &CancellationToken,
        messages: &[String],
    ) -> Result<(), RunnerError> {
        if messages.is_empty() {
            return Ok(());
        }
        let conn = self.connected().await?;
        let Ok(_in_flight) = conn.in_flight.try_lock() else {
            return Err(RunnerError::Busy);
        };
        let session_id = conn.current_session().ok_or(RunnerError::NoSession)?;
        let blocks = messages.iter().map(ContentBlock::text).collect();
        let stop_reason = self.prompt(&conn, cancel, &session_id, blocks).await?;
        debug!(count = messages.len(), stop_reason = %stop_reason, "delivered user messages");
        Ok(())
    }

    async fn stop(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock().await;
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };
        if let Lifecycle::Started(conn) = previous {
            conn.transport.close().await;
            info!("runner stopped");
        }
    }
}
