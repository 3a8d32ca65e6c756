//! Retry state for in-flight safe-mode envelopes.

use std::time::{Duration, Instant};

/// Per-envelope retry budget and next-retry deadline.
///
/// Created when a safe-mode envelope is first transmitted and dropped when
/// the peer's ack number passes it. Deadlines are checked cooperatively on
/// the owning connection's tick, not by OS timers.
#[derive(Debug, Clone)]
pub struct RetransmissionRecord {
    tries_left: u8,
    next_retry_at: Instant,
}

impl RetransmissionRecord {
    /// Create a record with a full budget and its first deadline.
    pub fn new(budget: u8, now: Instant, delay: Duration) -> Self {
        Self {
            tries_left: budget,
            next_retry_at: now + delay,
        }
    }

    /// Whether the retry deadline has passed.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_retry_at
    }

    /// Consume one retry and reschedule the deadline.
    ///
    /// Returns `false` when the budget is exhausted; the owning connection
    /// must then terminate as unreachable.
    pub fn try_consume(&mut self, now: Instant, delay: Duration) -> bool {
        if self.tries_left == 0 {
            return false;
        }
        self.tries_left -= 1;
        self.next_retry_at = now + delay;
        true
    }

    /// Retries remaining.
    pub fn tries_left(&self) -> u8 {
        self.tries_left
    }
}
