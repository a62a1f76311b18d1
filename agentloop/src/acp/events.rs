//! Typed events streamed from the runner to its listener.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Terminal classification of a prompt call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
    Error,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::MaxTurnRequests => "max_turn_requests",
            StopReason::Refusal => "refusal",
            StopReason::Cancelled => "cancelled",
            StopReason::Error => "error",
        }
    }

    /// Map a wire `stopReason`. Unrecognised values count as a normal end of turn.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "max_tokens" => StopReason::MaxTokens,
            "max_turn_requests" => StopReason::MaxTurnRequests,
            "refusal" => StopReason::Refusal,
            "cancelled" => StopReason::Cancelled,
            _ => StopReason::EndTurn,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPhase {
    Started,
    Updated,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallEvent {
    pub id: String,
    pub title: Option<String>,
    pub kind: Option<String>,
    pub phase: ToolPhase,
    /// Raw status string as reported by the agent.
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishEvent {
    pub stop_reason: StopReason,
    pub duration: Duration,
    pub error: Option<String>,
}

/// One callback from the runner, delivered in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    Text(String),
    Thinking(String),
    ToolCall(ToolCallEvent),
    FileChange(PathBuf),
    Finish(FinishEvent),
}

/// Outcome of a successful `run_iteration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationOutcome {
    pub stop_reason: StopReason,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_wire_stop_reason_is_end_turn() {
        assert_eq!(StopReason::from_wire("cancelled"), StopReason::Cancelled);
        assert_eq!(StopReason::from_wire("something_new"), StopReason::EndTurn);
        assert_eq!(StopReason::MaxTurnRequests.to_string(), "max_turn_requests");
    }
}
