//! Loop configuration stored in `agentloop.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::acp::McpServer;
use crate::io::hooks::HookSpec;
use crate::store::validate_session_name;

pub const DEFAULT_CONFIG_FILE: &str = "agentloop.toml";

/// Loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Session name; also the event log file stem.
    pub session: String,

    /// Iterations to run per invocation (0 = until complete or cancelled).
    pub max_iterations: u32,

    /// Commit the worktree after iterations that changed files.
    pub auto_commit: bool,

    /// Restart the agent after this many consecutive failed iterations (0 = never).
    pub restart_after_errors: u32,

    /// Directory the agent and hooks run in.
    pub workdir: PathBuf,

    pub agent: AgentConfig,
    pub store: StoreConfig,
    pub prompt: PromptConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable speaking ACP on stdio.
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Model selected for every new session, if set.
    pub model: Option<String>,
    pub mcp_servers: Vec<McpServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one `<session>.jsonl` per session.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Soft cap on the rendered prompt size.
    pub budget_bytes: usize,
    /// Iteration summaries included as history.
    pub history_limit: usize,
    pub extra_instructions: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HooksConfig {
    pub pre_iteration: Vec<HookSpec>,
    pub post_iteration: Vec<HookSpec>,
    pub on_error: Vec<HookSpec>,
    pub on_task_complete: Vec<HookSpec>,
    pub on_complete: Vec<HookSpec>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            session: "default".to_string(),
            max_iterations: 0,
            auto_commit: false,
            restart_after_errors: 3,
            workdir: PathBuf::from("."),
            agent: AgentConfig::default(),
            store: StoreConfig::default(),
            prompt: PromptConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude-code-acp".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            model: None,
            mcp_servers: Vec::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".agentloop/sessions"),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 32_000,
            history_limit: 5,
            extra_instructions: String::new(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        validate_session_name(&self.session).context("invalid session")?;
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must not be empty"));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        for server in &self.agent.mcp_servers {
            if server.name.trim().is_empty() || server.command.trim().is_empty() {
                return Err(anyhow!("agent.mcp_servers entries need a name and a command"));
            }
        }
        let all_hooks = [
            ("pre_iteration", &self.hooks.pre_iteration),
            ("post_iteration", &self.hooks.post_iteration),
            ("on_error", &self.hooks.on_error),
            ("on_task_complete", &self.hooks.on_task_complete),
            ("on_complete", &self.hooks.on_complete),
        ];
        for (point, hooks) in all_hooks {
            if hooks.iter().any(|hook| hook.command.trim().is_empty()) {
                return Err(anyhow!("hooks.{point} contains an empty command"));
            }
        }
        Ok(())
    }
}

/// Resolve a configured `path` against the directory holding the config file.
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
