//! Stable exit codes for agentloop CLI commands.

/// Command succeeded; `run` ended because the session completed or hit its iteration limit.
pub const OK: i32 = 0;
/// Invalid config, unknown task, store failure or any other error.
pub const INVALID: i32 = 1;
/// `agentloop next` found no eligible task.
pub const NO_TASK: i32 = 2;
/// `agentloop run` was interrupted before the session completed.
pub const CANCELLED: i32 = 3;
