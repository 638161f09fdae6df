//! In-process log ring (spec.md §4.13): 500 entries, `debug|info|warn|error`.
//!
//! This is in addition to, not instead of, `tracing` — `tracing` is for
//! process operators tailing stdout or a collector; this ring is a queryable
//! in-process structure the (out-of-scope) API layer would read to show
//! "recent activity" without standing up a log aggregator.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

const CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(CAPACITY)),
        }
    }

    fn push(&self, level: LogLevel, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() == CAPACITY {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            level,
            message: message.into(),
            created_at: Utc::now(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.push(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    /// The `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        entries.iter().rev().take(n).cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let buffer = LogBuffer::new();
        for i in 0..(CAPACITY + 10) {
            buffer.info(format!("line {i}"));
        }
        let recent = buffer.recent(1);
        assert_eq!(recent[0].message, format!("line {}", CAPACITY + 9));
    }

    #[test]
    fn recent_reports_newest_first() {
        let buffer = LogBuffer::new();
        buffer.debug("first");
        buffer.error("second");
        let recent = buffer.recent(2);
        assert_eq!(recent[0].message, "second");
        assert_eq!(recent[1].message, "first");
    }
}
