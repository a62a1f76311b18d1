//! Git auto-commit after iterations that touched files.
//!
//! A small, explicit wrapper around `git` subprocess calls plus the
//! [`Committer`] seam the orchestrator calls through.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

/// Commits the work of one iteration.
pub trait Committer: Send + Sync {
    /// Returns `false` when there was nothing to commit.
    fn commit(&self, session: &str, iteration: u32) -> Result<bool>;
}

pub fn commit_message(session: &str, iteration: u32) -> String {
    format!("chore(agentloop): session {session} iteration {iteration}")
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Stages everything and commits it.
#[derive(Debug, Clone)]
pub struct GitCommitter {
    git: Git,
}

impl GitCommitter {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            git: Git::new(workdir),
        }
    }
}

impl Committer for GitCommitter {
    #[instrument(skip_all, fields(session = %session, iteration = iteration))]
    fn commit(&self, session: &str, iteration: u32) -> Result<bool> {
        self.git.add_all().context("stage changes")?;
        let committed = self
            .git
            .commit_staged(&commit_message(session, iteration))
            .context("commit iteration")?;
        if committed {
            info!("committed iteration changes");
        }
        Ok(committed)
    }
}
