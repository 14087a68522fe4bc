//! Bounded per-process log buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Readers never see more than this many entries per handle.
pub const MAX_EXPOSED_LOG_ENTRIES: usize = 40;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub stream: LogStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Fixed-capacity ring buffer: pushing past capacity evicts the oldest entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRing {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, stream: LogStream, line: impl Into<String>) {
        self.push_entry(LogEntry {
            stream,
            line: line.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn push_entry(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// The newest `limit` entries, oldest first, never more than the exposure cap.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let limit = limit.min(MAX_EXPOSED_LOG_ENTRIES);
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::with_capacity(MAX_EXPOSED_LOG_ENTRIES)
    }
}

impl Serialize for LogRing {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.recent(MAX_EXPOSED_LOG_ENTRIES).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LogRing {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<LogEntry>::deserialize(deserializer)?;
        let mut ring = LogRing::default();
        for entry in entries {
            ring.push_entry(entry);
        }
        Ok(ring)
    }
}
