//! Lifecycle hooks: shell commands run around iterations.
//!
//! The [`HookExecutor`] trait decouples the orchestrator from how hooks run.
//! Tests use scripted executors that echo their commands without spawning
//! processes.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 60;

/// One configured hook command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSpec {
    /// Shell command, run with `sh -c`.
    pub command: String,
    /// Forward stdout to the agent in the next prompt.
    pub pipe_output: bool,
    /// Kill the hook after this many seconds (default 60).
    pub timeout_secs: Option<u64>,
}

impl HookSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn piped(command: impl Into<String>) -> Self {
        Self {
            pipe_output: true,
            ..Self::new(command)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_HOOK_TIMEOUT_SECS))
    }
}

/// Variables exported to hooks as `AGENTLOOP_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookVars {
    pub session: String,
    pub iteration: u32,
    pub task_id: Option<String>,
    pub task_content: Option<String>,
    pub error: Option<String>,
}

impl HookVars {
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("AGENTLOOP_SESSION", self.session.clone()),
            ("AGENTLOOP_ITERATION", self.iteration.to_string()),
        ];
        if let Some(id) = &self.task_id {
            env.push(("AGENTLOOP_TASK_ID", id.clone()));
        }
        if let Some(content) = &self.task_content {
            env.push(("AGENTLOOP_TASK_CONTENT", content.clone()));
        }
        if let Some(error) = &self.error {
            env.push(("AGENTLOOP_ERROR", error.clone()));
        }
        env
    }
}

#[async_trait]
pub trait HookExecutor: Send + Sync {
    /// Run every hook in order and return all of their output.
    async fn execute_all(
        &self,
        cancel: &CancellationToken,
        hooks: &[HookSpec],
        workdir: &Path,
        vars: &HookVars,
    ) -> Result<String>;

    /// Run every hook in order, returning only the output of hooks with
    /// `pipe_output` set.
    async fn execute_piped(
        &self,
        cancel: &CancellationToken,
        hooks: &[HookSpec],
        workdir: &Path,
        vars: &HookVars,
    ) -> Result<String>;
}

/// Runs hooks through `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellHookExecutor;

impl ShellHookExecutor {
    async fn run_all(
        &self,
        cancel: &CancellationToken,
        hooks: &[HookSpec],
        workdir: &Path,
        vars: &HookVars,
        piped_only: bool,
    ) -> Result<String> {
        let mut outputs = Vec::new();
        for hook in hooks {
            if cancel.is_cancelled() {
                debug!("hooks cancelled");
                break;
            }
            let (output, failed) = match run_hook(cancel, hook, workdir, vars).await {
                Ok(output) => (output, false),
                Err(err) => {
                    warn!(command = %hook.command, err = %format!("{err:#}"), "hook failed");
                    (format!("[hook {} failed: {err:#}]", hook.command), true)
                }
            };
            // Failure notices are surfaced even for unpiped hooks.
            if (!piped_only || hook.pipe_output || failed) && !output.trim().is_empty() {
                outputs.push(output.trim_end().to_string());
            }
        }
        Ok(outputs.join("\n"))
    }
}

#[async_trait]
impl HookExecutor for ShellHookExecutor {
    async fn execute_all(
        &self,
        cancel: &CancellationToken,
        hooks: &[HookSpec],
        workdir: &Path,
        vars: &HookVars,
    ) -> Result<String> {
        self.run_all(cancel, hooks, workdir, vars, false).await
    }

    async fn execute_piped(
        &self,
        cancel: &CancellationToken,
        hooks: &[HookSpec],
        workdir: &Path,
        vars: &HookVars,
    ) -> Result<String> {
        self.run_all(cancel, hooks, workdir, vars, true).await
    }
}

#[instrument(skip_all, fields(command = %hook.command, timeout_secs = hook.timeout().as_secs()))]
async fn run_hook(
    cancel: &CancellationToken,
    hook: &HookSpec,
    workdir: &Path,
    vars: &HookVars,
) -> Result<String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&hook.command)
        .current_dir(workdir)
        .envs(vars.env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning hook");
    let child = cmd.spawn().context("spawn hook")?;
    let timeout = hook.timeout();

    // Dropping the wait future drops the child, which kills it.
    let output = tokio::select! {
        () = cancel.cancelled() => anyhow::bail!("cancelled"),
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(output) => output.context("wait for hook")?,
            Err(_) => anyhow::bail!("timed out after {}s", timeout.as_secs()),
        },
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "exit status {:?}: {}",
            output.status.code(),
            stderr.trim()
        );
    }
    debug!(bytes = output.stdout.len(), "hook finished");
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HookVars {
        HookVars {
            session: "demo".into(),
            iteration: 4,
            task_id: Some("t-1".into()),
            ..HookVars::default()
        }
    }

    /// Only piped hooks reach the agent; variables are exported.
    #[tokio::test]
    async fn piped_output_skips_unpiped_hooks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hooks = vec![
            HookSpec::piped("echo \"$AGENTLOOP_SESSION:$AGENTLOOP_ITERATION:$AGENTLOOP_TASK_ID\""),
            HookSpec::new("echo hidden"),
        ];
        let cancel = CancellationToken::new();

        let piped = ShellHookExecutor
            .execute_piped(&cancel, &hooks, temp.path(), &vars())
            .await
            .expect("hooks");
        assert_eq!(piped, "demo:4:t-1");

        let all = ShellHookExecutor
            .execute_all(&cancel, &hooks, temp.path(), &vars())
            .await
            .expect("hooks");
        assert_eq!(all, "demo:4:t-1\nhidden");
    }

    /// A failing hook leaves a notice and does not stop later hooks.
    #[tokio::test]
    async fn failing_hook_does_not_abort_the_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hooks = vec![
            HookSpec::piped("echo oops >&2; exit 3"),
            HookSpec::piped("echo after"),
        ];
        let out = ShellHookExecutor
            .execute_piped(&CancellationToken::new(), &hooks, temp.path(), &vars())
            .await
            .expect("hooks");

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2, "{out}");
        assert!(lines[0].starts_with("[hook echo oops >&2; exit 3 failed:"));
        assert!(lines[0].contains("oops"));
        assert_eq!(lines[1], "after");
    }

    #[tokio::test]
    async fn slow_hook_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let hooks = vec![HookSpec {
            command: "sleep 5".into(),
            pipe_output: true,
            timeout_secs: Some(0),
        }];
        let out = ShellHookExecutor
            .execute_piped(&CancellationToken::new(), &hooks, temp.path(), &vars())
            .await
            .expect("hooks");
        assert!(out.contains("timed out"), "{out}");
    }
}
