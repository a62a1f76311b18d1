//! In-process event log, used by tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;

use crate::core::types::{Event, NewEvent};
use crate::store::{EventLog, StoreError};

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, Vec<Event>>,
    closed: bool,
}

/// Event log held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    inner: Mutex<Inner>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for InMemoryEventLog {
    fn append(&self, session: &str, event: NewEvent) -> Result<Event, StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let events = inner.sessions.entry(session.to_string()).or_default();
        let id = events.last().map_or(1, |last| last.id + 1);
        let stored = Event {
            id,
            timestamp: Utc::now(),
            session: session.to_string(),
            kind: event.kind,
            action: event.action,
            meta: event.meta,
            data: event.data,
        };
        events.push(stored.clone());
        Ok(stored)
    }

    fn replay(&self, session: &str) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.sessions.get(session).cloned().unwrap_or_default())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        inner.closed = true;
        Ok(())
    }
}
