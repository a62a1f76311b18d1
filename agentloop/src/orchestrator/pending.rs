//! Text accumulated between iterations for delivery with the next prompt.

use std::sync::Mutex;

/// Thread-safe FIFO text buffer.
///
/// Appends from any context are joined with newlines; the orchestrator drains
/// the whole buffer once per iteration.
#[derive(Debug, Default)]
pub struct PendingOutput {
    buf: Mutex<String>,
}

impl PendingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `text` to the buffer. Empty text is ignored.
    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut buf = self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(text);
    }

    /// Take everything appended since the last drain.
    pub fn drain(&self) -> String {
        let mut buf = self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *buf)
    }

    pub fn has_pending(&self) -> bool {
        let buf = self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        !buf.is_empty()
    }
}

/// Join non-empty segments with a single newline.
pub fn join_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    segments
        .into_iter()
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
