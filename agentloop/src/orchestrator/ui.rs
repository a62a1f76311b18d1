//! Outbound notifications from the loop to whatever presents it.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::acp::{RunnerEvent, RunnerListener, StopReason, ToolPhase};

/// Coarse loop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::Paused => "paused",
            LoopState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    StateChanged(LoopState),
    IterationStarted {
        iteration: u32,
    },
    IterationFinished {
        iteration: u32,
        stop_reason: StopReason,
        duration: Duration,
        error: Option<String>,
    },
    /// Streamed agent output, forwarded as received.
    Runner(RunnerEvent),
    TaskCompleted {
        id: String,
        content: String,
    },
    Committed {
        iteration: u32,
    },
    SessionComplete,
    /// Hook failures, delivery fallbacks and similar non-fatal conditions.
    Notice(String),
}

/// Receives loop notifications. Must not block.
pub trait UiSink: Send + Sync {
    fn emit(&self, event: UiEvent);
}

/// Runner listener that forwards to the UI and tracks touched files.
pub struct LoopListener {
    ui: Arc<dyn UiSink>,
    changed: Mutex<BTreeSet<PathBuf>>,
}

impl LoopListener {
    pub fn new(ui: Arc<dyn UiSink>) -> Self {
        Self {
            ui,
            changed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Forget files seen so far.
    pub fn reset_changes(&self) {
        self.changed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn take_changes(&self) -> BTreeSet<PathBuf> {
        std::mem::take(
            &mut *self
                .changed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

impl RunnerListener for LoopListener {
    fn on_event(&self, event: RunnerEvent) {
        if let RunnerEvent::FileChange(path) = &event {
            debug!(path = %path.display(), "file change observed");
            self.changed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(path.clone());
        }
        self.ui.emit(UiEvent::Runner(event));
    }
}

/// Plain terminal presentation: agent text on stdout, progress on stderr.
#[derive(Debug, Default)]
pub struct ConsoleUi;

impl UiSink for ConsoleUi {
    fn emit(&self, event: UiEvent) {
        match event {
            UiEvent::Runner(RunnerEvent::Text(text)) => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            UiEvent::Runner(RunnerEvent::ToolCall(call)) if call.phase == ToolPhase::Started => {
                eprintln!(
                    "\n> {} {}",
                    call.kind.as_deref().unwrap_or("tool"),
                    call.title.as_deref().unwrap_or(&call.id)
                );
            }
            UiEvent::Runner(_) => {}
            UiEvent::IterationStarted { iteration } => {
                eprintln!("\n=== iteration {iteration} ===");
            }
            UiEvent::IterationFinished {
                iteration,
                stop_reason,
                duration,
                error,
            } => match error {
                Some(err) => {
                    warn!(iteration, err = %err, "iteration failed");
                    eprintln!("\n=== iteration {iteration} failed after {duration:.1?}: {err} ===");
                }
                None => eprintln!(
                    "\n=== iteration {iteration} finished ({stop_reason}) in {duration:.1?} ==="
                ),
            },
            UiEvent::TaskCompleted { id, content } => eprintln!("task {id} completed: {content}"),
            UiEvent::Committed { iteration } => eprintln!("committed iteration {iteration}"),
            UiEvent::SessionComplete => eprintln!("session complete"),
            UiEvent::StateChanged(state) => info!(state = state.as_str(), "loop state changed"),
            UiEvent::Notice(text) => eprintln!("{text}"),
        }
    }
}
