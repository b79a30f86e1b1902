use crate::source::file_id::FileId;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// One harvested line and where it came from.
///
/// `line` holds the raw bytes with the delimiter (and a trailing `\r`) removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub source: PathBuf,
    pub file_id: FileId,
    /// Byte offset of the first byte of `line` in the file
    pub offset: u64,
    pub read_at: DateTime<Utc>,
    pub line: Vec<u8>,
    /// Set when the line was cut at `max_line_bytes` and the remainder skipped
    pub truncated: bool,
}

impl Event {
    /// Lossy UTF-8 view of the line
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.line)
    }
}
