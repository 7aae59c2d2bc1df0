//! Bounded diagnostic log kept by the connection controller.

use std::collections::VecDeque;

/// Number of entries kept before the oldest is dropped.
pub const EVENT_LOG_CAPACITY: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    /// Unix epoch milliseconds.
    pub at: i64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<EventEntry>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, at: i64, message: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(EventEntry {
            at,
            message: message.into(),
        });
    }

    pub fn push_now(&mut self, message: impl Into<String>) {
        self.push(pairlink_core::now_millis(), message);
    }

    /// Entries from oldest to newest.
    pub fn entries(&self) -> Vec<EventEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
