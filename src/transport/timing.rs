//! RTT estimation and send-time tracking.
//!
//! Retry and ack timing derive from a smoothed round-trip time. The
//! smoothing rule is the **median** of a bounded window of recent samples,
//! which a single retransmission-induced outlier cannot drag. Before any
//! sample exists a conservative fixed default applies.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::core::{DEFAULT_RTT, RTT_SAMPLE_WINDOW, SEND_TIME_HORIZON};

/// Median-of-window RTT estimator.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    samples: VecDeque<Duration>,
    window: usize,
    default: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create an estimator with the protocol's default window and fallback.
    pub fn new() -> Self {
        Self::with_limits(RTT_SAMPLE_WINDOW, DEFAULT_RTT)
    }

    /// Create an estimator with explicit window size and pre-sample default.
    pub fn with_limits(window: usize, default: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            default,
        }
    }

    /// Add a round-trip sample, evicting the oldest past the window.
    pub fn record_sample(&mut self, sample: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// The smoothed RTT: median of the recent window, or the fixed default
    /// before any samples exist.
    pub fn smoothed(&self) -> Duration {
        if self.samples.is_empty() {
            return self.default;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }

    /// Number of samples currently in the window.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Send timestamps per outstanding sequence number.
///
/// Entries are pruned oldest-first past a fixed horizon even if never
/// acked, bounding memory when a peer stops acking.
#[derive(Debug, Default)]
pub struct SendTimeTracker {
    entries: VecDeque<(u32, Instant)>,
}

impl SendTimeTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the send time of a sequence number.
    pub fn record(&mut self, seq: u32, sent_at: Instant) {
        if self.entries.len() == SEND_TIME_HORIZON {
            self.entries.pop_front();
        }
        self.entries.push_back((seq, sent_at));
    }

    /// Remove and return the send time of a sequence number, if still held.
    pub fn take(&mut self, seq: u32) -> Option<Instant> {
        let idx = self.entries.iter().position(|&(s, _)| s == seq)?;
        self.entries.remove(idx).map(|(_, t)| t)
    }

    /// Number of outstanding timestamps.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timestamps are outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
