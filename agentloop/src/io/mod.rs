//! Side-effecting helpers the loop and CLI depend on.

pub mod config;
pub mod git;
pub mod hooks;
pub mod prompt;
