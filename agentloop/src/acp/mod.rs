//! Protocol client driving an external coding agent over the Agent Client
//! Protocol (JSON-RPC 2.0, one message per line on stdio).
//!
//! Layers, bottom-up:
//! - [`jsonrpc`]: request/response correlation over any byte stream.
//! - [`transport`]: ACP methods on top of a connection ([`AgentTransport`]).
//! - [`process`]: spawns the agent subprocess ([`AgentSpawner`]).
//! - [`client`]: [`AcpRunner`], the subprocess and per-iteration session
//!   lifecycle exposed to the orchestrator as a [`Runner`].

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod client;
pub mod events;
pub mod jsonrpc;
pub mod process;
pub mod protocol;
pub mod transport;

pub use client::{AcpRunner, AcpRunnerConfig};
pub use events::{FinishEvent, IterationOutcome, RunnerEvent, StopReason, ToolCallEvent, ToolPhase};
pub use process::ProcessSpawner;
pub use protocol::{ContentBlock, McpServer, SessionUpdate};
pub use transport::AcpTransport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("spawn agent: {0}")]
    Spawn(String),
    #[error("initialize handshake: {0}")]
    Handshake(Box<RunnerError>),
    #[error("create session: {0}")]
    SessionCreate(Box<RunnerError>),
    #[error("set model: {0}")]
    ModelSet(Box<RunnerError>),
    #[error("prompt: {0}")]
    Prompt(Box<RunnerError>),
    #[error("runner not started")]
    NotStarted,
    #[error("no active agent session")]
    NoSession,
    #[error("another request is already in flight")]
    Busy,
    #[error("agent connection closed: {0}")]
    Connection(String),
    #[error("agent error {code}: {message}")]
    Protocol { code: i64, message: String },
}

/// Receives runner callbacks in stream order.
///
/// Called inline from the stream reader; implementations must not block.
pub trait RunnerListener: Send + Sync {
    fn on_event(&self, event: RunnerEvent);
}

/// The orchestrator's view of the agent.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Spawn the agent and complete the handshake. A failed start leaves the
    /// runner not started.
    async fn start(&self, cancel: &CancellationToken) -> Result<(), RunnerError>;

    /// Open a fresh session and run one prompt. `hook_output`, when non-empty,
    /// is sent as a block ahead of `prompt`.
    async fn run_iteration(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        hook_output: &str,
    ) -> Result<IterationOutcome, RunnerError>;

    /// Deliver out-of-band user messages to the current session.
    async fn send_messages(
        &self,
        cancel: &CancellationToken,
        messages: &[String],
    ) -> Result<(), RunnerError>;

    /// Terminate the agent. Safe to call any number of times.
    async fn stop(&self);
}

/// Narrow capability over one agent connection.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn initialize(&self) -> Result<(), RunnerError>;

    async fn new_session(&self, cwd: &Path, mcp_servers: &[McpServer])
    -> Result<String, RunnerError>;

    async fn set_model(&self, session_id: &str, model: &str) -> Result<(), RunnerError>;

    /// Send a prompt and stream its updates to `on_update` until the agent
    /// answers with a stop reason.
    async fn prompt(
        &self,
        session_id: &str,
        blocks: Vec<ContentBlock>,
        on_update: &(dyn Fn(SessionUpdate) + Send + Sync),
    ) -> Result<StopReason, RunnerError>;

    async fn cancel(&self, session_id: &str) -> Result<(), RunnerError>;

    /// Release the connection and any process behind it. Idempotent.
    async fn close(&self);
}

/// Produces connected transports, one per agent process.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(&self) -> Result<Box<dyn AgentTransport>, RunnerError>;
}
