//! Iteration prompt builder.
//!
//! Renders the session projection through a sectioned template, then fits the
//! result into a byte budget by dropping less critical sections first.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::selector::{is_unblocked, next_task};
use crate::core::types::{NoteKind, SessionState, Task, TaskStatus};
use crate::io::config::PromptConfig;

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");

/// Droppable sections, least critical first.
const DROP_ORDER: [&str; 4] = ["history", "notes", "tasks", "instructions"];
const TRUNCATED_MARKER: &str = "\n[truncated]";

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    status: &'static str,
    priority: u8,
    dependencies: Vec<String>,
    blocked: bool,
    content: String,
}

impl TaskContext {
    fn from_task(state: &SessionState, task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status.as_str(),
            priority: task.priority,
            dependencies: task.dependencies.iter().cloned().collect(),
            blocked: task.status == TaskStatus::Remaining && !is_unblocked(state, task),
            content: task.content.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct NoteGroup {
    kind: &'static str,
    items: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryEntry {
    number: u32,
    summary: String,
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    /// Section identifier (e.g., "contract", "tasks").
    key: String,
    /// Whether this section is required (cannot be dropped).
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex is valid")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, body_start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map_or(rendered.len(), |(next_start, ..)| *next_start);
        let content = rendered[*body_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .rev()
        .skip(1)
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    let Some(last) = sections.last_mut() else {
        return;
    };
    let before_len = last.content.len();
    if allowed > TRUNCATED_MARKER.len() {
        truncate_at_char_boundary(&mut last.content, allowed - TRUNCATED_MARKER.len());
        last.content.push_str(TRUNCATED_MARKER);
    } else {
        truncate_at_char_boundary(&mut last.content, allowed);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds the per-iteration prompt within a byte budget.
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    config: PromptConfig,
}

impl PromptBuilder {
    pub fn new(config: PromptConfig) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("iteration", ITERATION_TEMPLATE)
            .context("load iteration template")?;
        Ok(Self { env, config })
    }

    /// Render the prompt for `iteration` from the current projection.
    pub fn build(&self, session: &str, iteration: u32, state: &SessionState) -> Result<String> {
        let task = next_task(state).map(|task| TaskContext::from_task(state, task));
        let tasks: Vec<TaskContext> = state
            .tasks
            .iter()
            .map(|task| TaskContext::from_task(state, task))
            .collect();
        let notes: Vec<NoteGroup> = NoteKind::ALL
            .iter()
            .map(|kind| NoteGroup {
                kind: kind.as_str(),
                items: state
                    .notes_of(Some(*kind))
                    .iter()
                    .map(|note| note.content.trim().to_string())
                    .collect(),
            })
            .filter(|group| !group.items.is_empty())
            .collect();
        let history: Vec<HistoryEntry> = state
            .recent_iterations(self.config.history_limit)
            .iter()
            .map(|record| HistoryEntry {
                number: record.number,
                summary: record.summary.trim().to_string(),
            })
            .collect();
        let instructions = self.config.extra_instructions.trim();

        let rendered = self
            .env
            .get_template("iteration")
            .context("get iteration template")?
            .render(context! {
                session => session,
                iteration => iteration,
                task => task,
                tasks => tasks,
                notes => notes,
                history => history,
                instructions => (!instructions.is_empty()).then_some(instructions),
            })
            .context("render iteration prompt")?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.config.budget_bytes);
        Ok(render_sections(&sections))
    }
}
