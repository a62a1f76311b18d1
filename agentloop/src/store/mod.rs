//! Append-only, replayable event logs scoped by session name.
//!
//! [`EventLog`] is the persistence capability; [`SessionStore`] layers typed
//! append helpers and projections on top of one session of a log.

pub mod jsonl;
pub mod memory;
pub mod session;

use thiserror::Error;

use crate::core::types::{Event, NewEvent};

pub use jsonl::JsonlEventLog;
pub use memory::InMemoryEventLog;
pub use session::SessionStore;

/// Failures surfaced by event logs.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store is closed")]
    Closed,
    #[error("invalid session name '{name}': {reason}")]
    InvalidSession { name: String, reason: String },
    #[error("event log io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt event log {path} line {line}: {source}")]
    Corrupt {
        path: String,
        line: usize,
        source: serde_json::Error,
    },
    #[error("serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("event log lock poisoned")]
    Poisoned,
}

/// Persistence capability for session events.
///
/// Implementations must serialize appends so that per-session order matches the
/// order in which `append` calls acquire the log, and must never reorder or drop
/// a successful append.
pub trait EventLog: Send + Sync {
    /// Durably record one event, assigning its id and timestamp.
    fn append(&self, session: &str, event: NewEvent) -> Result<Event, StoreError>;

    /// All events for `session` in append order. Unknown sessions replay empty.
    fn replay(&self, session: &str) -> Result<Vec<Event>, StoreError>;

    /// Release resources. Idempotent; appends after close fail with [`StoreError::Closed`].
    fn close(&self) -> Result<(), StoreError>;
}

/// Validate that a session name is safe to use as a file stem.
pub fn validate_session_name(name: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidSession {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if name
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(invalid("must be [A-Za-z0-9._-] only"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_reject_path_characters() {
        assert!(validate_session_name("feature-x_1.2").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("../etc").is_err());
        assert!(validate_session_name("a/b").is_err());
        assert!(validate_session_name(".hidden").is_err());
    }
}
