//! File-backed event log: one append-only `<session>.jsonl` per session.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::core::types::{Event, NewEvent};
use crate::store::{EventLog, StoreError, validate_session_name};

#[derive(Debug, Clone, Copy)]
struct Cursor {
    next_id: u64,
    /// File length after our last write. A different length on disk means
    /// another process appended and the cursor must be recovered again.
    len: u64,
}

#[derive(Debug, Default)]
struct Inner {
    cursors: HashMap<String, Cursor>,
    closed: bool,
}

/// Event log persisted as newline-delimited JSON under a directory.
///
/// A single mutex serializes appends across sessions; each append is written
/// and flushed before the lock is released. Appends from other processes are
/// picked up on the next append, but are not locked against.
#[derive(Debug)]
pub struct JsonlEventLog {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonlEventLog {
    /// Open (creating if needed) a log directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "opened event log");
        Ok(Self {
            dir,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file backing `session`.
    pub fn session_path(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{session}.jsonl"))
    }

    fn next_id(&self, inner: &mut Inner, session: &str) -> Result<u64, StoreError> {
        let path = self.session_path(session);
        let on_disk = file_len(&path)?;
        if let Some(cursor) = inner.cursors.get(session) {
            if cursor.len == on_disk {
                return Ok(cursor.next_id);
            }
            debug!(session, "log changed outside this handle, rescanning");
        }
        let scan = scan_events(&path)?;
        if let Some((line, source)) = scan.unreadable_tail {
            // Appending past it would bury it mid-file.
            return Err(StoreError::Corrupt {
                path: path.display().to_string(),
                line,
                source,
            });
        }
        let mut len = on_disk;
        if let Some(valid_len) = scan.torn_at {
            warn!(path = %path.display(), valid_len, "truncating torn tail before append");
            OpenOptions::new().write(true).open(&path)?.set_len(valid_len)?;
            len = valid_len;
        } else if scan.unterminated {
            // The last event parsed but its newline never made it to disk.
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(b"\n")?;
            len += 1;
        }
        let next_id = scan.events.last().map_or(0, |event| event.id) + 1;
        inner
            .cursors
            .insert(session.to_string(), Cursor { next_id, len });
        Ok(next_id)
    }
}

impl EventLog for JsonlEventLog {
    #[instrument(skip_all, fields(session = %session, kind = event.kind.as_str(), action = %event.action))]
    fn append(&self, session: &str, event: NewEvent) -> Result<Event, StoreError> {
        validate_session_name(session)?;
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let id = self.next_id(&mut inner, session)?;
        let stored = Event {
            id,
            timestamp: Utc::now(),
            session: session.to_string(),
            kind: event.kind,
            action: event.action,
            meta: event.meta,
            data: event.data,
        };

        let mut line = serde_json::to_string(&stored)?;
        line.push('\n');
        let path = self.session_path(session);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        let len = file.metadata()?.len();

        inner.cursors.insert(
            session.to_string(),
            Cursor {
                next_id: id + 1,
                len,
            },
        );
        debug!(id, "event appended");
        Ok(stored)
    }

    fn replay(&self, session: &str) -> Result<Vec<Event>, StoreError> {
        validate_session_name(session)?;
        // Hold the lock so a replay never observes a half-written line.
        let _inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(scan_events(&self.session_path(session))?.events)
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        if !inner.closed {
            debug!(dir = %self.dir.display(), "closing event log");
        }
        inner.closed = true;
        Ok(())
    }
}

fn file_len(path: &Path) -> Result<u64, StoreError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

struct Scan {
    events: Vec<Event>,
    /// Byte length of the valid prefix when the file ends in a torn line.
    torn_at: Option<u64>,
    /// The final event decoded but is missing its trailing newline.
    unterminated: bool,
    /// A complete final line that did not decode.
    unreadable_tail: Option<(usize, serde_json::Error)>,
}

/// Read every event in `path`. A missing file is an empty log.
///
/// Only a final line without a trailing newline counts as torn; it is skipped
/// here and truncated by the next append. A complete final line that does not
/// decode is skipped here but never removed, and blocks appends. An
/// undecodable line followed by more events is corruption.
fn scan_events(path: &Path) -> Result<Scan, StoreError> {
    let mut scan = Scan {
        events: Vec::new(),
        torn_at: None,
        unterminated: false,
        unreadable_tail: None,
    };
    if !path.exists() {
        return Ok(scan);
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut offset = 0u64;
    let mut line_no = 0usize;
    let mut unreadable: Option<(usize, serde_json::Error)> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        line_no += 1;
        let start = offset;
        offset += n as u64;
        if line.trim().is_empty() {
            continue;
        }
        if let Some((bad_line, source)) = unreadable.take() {
            return Err(StoreError::Corrupt {
                path: path.display().to_string(),
                line: bad_line,
                source,
            });
        }
        let terminated = line.ends_with('\n');
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => {
                scan.unterminated = !terminated;
                scan.events.push(event);
            }
            Err(err) if !terminated => {
                warn!(path = %path.display(), line = line_no, err = %err, "skipping torn final event");
                scan.torn_at = Some(start);
            }
            Err(err) => unreadable = Some((line_no, err)),
        }
    }

    if let Some((bad_line, err)) = &unreadable {
        warn!(path = %path.display(), line = bad_line, err = %err, "skipping unreadable final event");
    }
    scan.unreadable_tail = unreadable;
    Ok(scan)
}
