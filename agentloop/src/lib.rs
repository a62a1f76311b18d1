//! Iterative agent loop over the Agent Client Protocol.
//!
//! An external coding agent is driven through repeated, fresh sessions. What
//! carries over between them is an append-only session log of tasks, notes
//! and iteration summaries, which the loop projects into each prompt.
//!
//! - **[`core`]**: Pure, deterministic logic (projection, task selection,
//!   completion checks). No I/O, fully testable in isolation.
//! - **[`store`]**: The session event log and its typed facade.
//! - **[`acp`]**: The agent protocol client and subprocess lifecycle.
//! - **[`io`]**: Config, hooks, git and prompt rendering.
//! - **[`orchestrator`]**: The iteration loop tying the above together.

pub mod acp;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
