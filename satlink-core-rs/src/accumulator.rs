//! Event accumulator on the satellite
//!
//! Buffers local events until the hub polls for them. One drain hands out the whole
//! batch in insertion order and leaves the accumulator empty.
//!
//! Overflow policy: once the soft cap is exceeded further events are dropped and the
//! caller is told exactly once to reset, since the hub can no longer be brought back
//! in sync with the lost events.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::error;

use crate::types::{EventBatch, EventRecord, FaultEvent};

/// Outcome of queueing one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Item queued
    Queued,
    /// Cap exceeded for the first time; the caller must trigger a reset
    Overflow,
    /// Cap exceeded, overflow already reported; item dropped
    Dropped,
}

#[derive(Debug, Default)]
struct Inner {
    vars: Vec<EventRecord>,
    errors: Vec<FaultEvent>,
    overflow_warned: bool,
}

/// Thread-safe queue of pending event records and fault events
#[derive(Debug)]
pub struct EventAccumulator {
    capacity: usize,
    inner: Mutex<Inner>,
    poll_seen: Notify,
}

impl EventAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
            poll_seen: Notify::new(),
        }
    }

    /// Queue one event record
    pub fn push(&self, record: EventRecord) -> PushOutcome {
        let mut inner = self.inner.lock();

        if inner.vars.len() >= self.capacity {
            return Self::overflow(&mut inner, self.capacity);
        }

        inner.vars.push(record);
        PushOutcome::Queued
    }

    /// Queue one raised or cleared fault
    pub fn push_fault(&self, fault: FaultEvent) -> PushOutcome {
        let mut inner = self.inner.lock();

        if inner.errors.len() >= self.capacity {
            return Self::overflow(&mut inner, self.capacity);
        }

        inner.errors.push(fault);
        PushOutcome::Queued
    }

    fn overflow(inner: &mut Inner, capacity: usize) -> PushOutcome {
        if inner.overflow_warned {
            return PushOutcome::Dropped;
        }

        error!(
            "Event list exceeded {} items, dropping further events and requesting reset",
            capacity
        );
        inner.overflow_warned = true;
        PushOutcome::Overflow
    }

    /// Take all pending items and signal the poll to the watchdog
    pub fn drain(&self) -> EventBatch {
        let batch = {
            let mut inner = self.inner.lock();
            EventBatch {
                vars: std::mem::take(&mut inner.vars),
                errors: std::mem::take(&mut inner.errors),
            }
        };

        // lock released before signaling
        self.poll_seen.notify_one();
        batch
    }

    /// Take only the pending event records, faults stay queued
    pub fn drain_vars(&self) -> Vec<EventRecord> {
        let vars = std::mem::take(&mut self.inner.lock().vars);
        self.poll_seen.notify_one();
        vars
    }

    /// Resolves at the next drain (or immediately if one happened since the last wait)
    pub async fn poll_seen(&self) {
        self.poll_seen.notified().await;
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.vars.len() + inner.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overflowed(&self) -> bool {
        self.inner.lock().overflow_warned
    }
}
