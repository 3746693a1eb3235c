//! Input file parsing for `telepipe send`.
//!
//! One JSON object per line: `{"priority": 1, "event": {...}}`. Blank lines
//! and lines starting with `#` are skipped. When `priority` is omitted the
//! event's kind decides it.

use serde::Deserialize;

use crate::event::Event;

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(default)]
    priority: Option<u8>,
    event: serde_json::Value,
}

/// A line ready for [`crate::pipeline::PipelineHandle::submit_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendLine {
    /// 1-based line number in the file.
    pub line: usize,
    /// Priority code.
    pub priority: u8,
    /// Serialized event.
    pub payload: String,
}

/// A line that could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    /// 1-based line number in the file.
    pub line: usize,
    /// Why it was skipped.
    pub reason: String,
}

/// Parsed contents of an input file.
#[derive(Debug, Default)]
pub struct SendBatch {
    /// Usable lines, in file order.
    pub lines: Vec<SendLine>,
    /// Lines that failed to parse.
    pub skipped: Vec<SkippedLine>,
}

/// Parse newline-delimited input.
#[must_use]
pub fn parse_send_lines(text: &str) -> SendBatch {
    let mut batch = SendBatch::default();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_line(trimmed) {
            Ok((priority, payload)) => batch.lines.push(SendLine {
                line,
                priority,
                payload,
            }),
            Err(reason) => batch.skipped.push(SkippedLine { line, reason }),
        }
    }
    batch
}

fn parse_line(text: &str) -> Result<(u8, String), String> {
    let raw: RawLine = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let payload = raw.event.to_string();
    let priority = match raw.priority {
        Some(code) => code,
        None => Event::parse(&payload)
            .map_err(|e| e.to_string())?
            .default_priority()
            .code(),
    };
    Ok((priority, payload))
}
