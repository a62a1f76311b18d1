//! Spawns the agent as a child process speaking ACP on stdio.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info, instrument};

use crate::acp::{AcpTransport, AgentSpawner, AgentTransport, RunnerError};

#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

#[async_trait]
impl AgentSpawner for ProcessSpawner {
    #[instrument(skip_all, fields(command = %self.command))]
    async fn spawn(&self) -> Result<Box<dyn AgentTransport>, RunnerError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| RunnerError::Spawn(format!("{}: {err}", self.command)))?;
        info!(pid = ?child.id(), "agent process spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Spawn("stdin was not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Spawn("stdout was not piped".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        Ok(Box::new(AcpTransport::connect(stdout, stdin, Some(child))))
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "agentloop::agent", "{line}");
    }
}
