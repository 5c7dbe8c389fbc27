//! In-memory event journal

use super::{EventSubscriber, LoopEvent, TransactionId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// One recorded loop event
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JournalEntry {
    /// Monotonic sequence number, starting at 1
    pub sequence: u64,
    /// [`LoopEvent::event_type`]
    pub event_type: &'static str,
    /// Name of the handler
    pub handler: Box<str>,
    /// Attempt the event belongs to
    pub attempt_index: u32,
    /// Transaction, when the event has one
    pub transaction: Option<TransactionId>,
    /// Sleep, for `will_sleep_between_attempts`
    pub sleep: Option<Duration>,
}

/// Subscriber that records every event it sees, in order
pub struct EventJournal {
    entries: RwLock<Vec<JournalEntry>>,
    counter: AtomicU64,
}

impl EventJournal {
    /// Empty journal
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            counter: AtomicU64::new(1),
        }
    }

    /// Every entry recorded so far, oldest first
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .read()
            .map(|e| e.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Event types in the order they were seen
    pub fn event_types(&self) -> Vec<&'static str> {
        self.entries().into_iter().map(|e| e.event_type).collect()
    }

    /// Sleeps announced by `WillSleepBetweenAttempts`, as last seen by this journal
    pub fn sleeps(&self) -> Vec<Duration> {
        self.entries().into_iter().filter_map(|e| e.sleep).collect()
    }

    /// Forget every entry
    pub fn clear(&self) {
        match self.entries.write() {
            Ok(mut entries) => entries.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl Default for EventJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSubscriber for EventJournal {
    fn on_event(&self, event: &mut LoopEvent) {
        let entry = JournalEntry {
            sequence: self.counter.fetch_add(1, Ordering::Relaxed),
            event_type: event.event_type(),
            handler: event.invocation().handler.clone(),
            attempt_index: event.invocation().attempt_index,
            transaction: event.transaction(),
            sleep: event.sleep(),
        };
        match self.entries.write() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}
