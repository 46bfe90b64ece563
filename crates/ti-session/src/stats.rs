//! Consuming statistics with atomic counters.
//!
//! Each session owns one [`ConsumingStats`]. The fetch task updates it and
//! every emitted event carries a [`ConsumingSnapshot`].
//!
//! # Thread Safety
//!
//! All counters use [`AtomicU64`] with
//! [`Relaxed`](std::sync::atomic::Ordering::Relaxed) ordering. They are for
//! display and need no ordering with respect to the batches themselves.
//!
//! # Examples
//!
//! ```
//! use ti_session::ConsumingStats;
//!
//! let stats = ConsumingStats::new();
//! stats.record_fetch(12, 4_096, 3);
//! stats.record_emitted(5);
//!
//! let snap = stats.snapshot();
//! assert_eq!(snap.messages_consumed, 12);
//! assert_eq!(snap.messages_emitted, 5);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters for one consumption session.
#[derive(Debug, Default)]
pub struct ConsumingStats {
    /// Messages received from the source.
    messages_consumed: AtomicU64,
    /// Payload bytes received from the source.
    bytes_consumed: AtomicU64,
    /// Messages that passed the filter and were emitted.
    messages_emitted: AtomicU64,
    /// Messages excluded because filter evaluation failed.
    filter_apply_errors: AtomicU64,
    /// Completed fetches.
    fetches: AtomicU64,
    /// Total time spent waiting on the source.
    elapsed_ms: AtomicU64,
    /// Set when the session was stopped before finishing on its own.
    cancelled: AtomicBool,
}

impl ConsumingStats {
    /// Creates a new [`ConsumingStats`] with all counters at zero.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed fetch.
    #[inline]
    pub fn record_fetch(&self, messages: u64, bytes: u64, elapsed_ms: u64) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.messages_consumed.fetch_add(messages, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(bytes, Ordering::Relaxed);
        self.elapsed_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    /// Records messages handed to the sink.
    #[inline]
    pub fn record_emitted(&self, messages: u64) {
        self.messages_emitted.fetch_add(messages, Ordering::Relaxed);
    }

    /// Records messages excluded by evaluation failures.
    #[inline]
    pub fn record_filter_errors(&self, errors: u64) {
        self.filter_apply_errors.fetch_add(errors, Ordering::Relaxed);
    }

    /// Marks the session as cancelled.
    #[inline]
    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> ConsumingSnapshot {
        ConsumingSnapshot {
            messages_consumed: self.messages_consumed.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            messages_emitted: self.messages_emitted.load(Ordering::Relaxed),
            filter_apply_errors: self.filter_apply_errors.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            elapsed_ms: self.elapsed_ms.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.messages_consumed.store(0, Ordering::Relaxed);
        self.bytes_consumed.store(0, Ordering::Relaxed);
        self.messages_emitted.store(0, Ordering::Relaxed);
        self.filter_apply_errors.store(0, Ordering::Relaxed);
        self.fetches.store(0, Ordering::Relaxed);
        self.elapsed_ms.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
    }
}

/// A point-in-time view of [`ConsumingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumingSnapshot {
    /// Messages received from the source.
    pub messages_consumed: u64,
    /// Payload bytes received from the source.
    pub bytes_consumed: u64,
    /// Messages that passed the filter and were emitted.
    pub messages_emitted: u64,
    /// Messages excluded because filter evaluation failed.
    pub filter_apply_errors: u64,
    /// Completed fetches.
    pub fetches: u64,
    /// Total time spent waiting on the source.
    pub elapsed_ms: u64,
    /// Whether the session was stopped before finishing on its own.
    pub cancelled: bool,
}

impl ConsumingSnapshot {
    /// Share of consumed messages that were emitted, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Counts are far below 2^52
    pub fn match_percent(&self) -> f64 {
        if self.messages_consumed == 0 {
            0.0
        } else {
            (self.messages_emitted as f64 / self.messages_consumed as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new_is_zero() {
        assert_eq!(ConsumingStats::new().snapshot(), ConsumingSnapshot::default());
    }

    #[test]
    fn test_stats_accumulate() {
        let stats = ConsumingStats::new();
        stats.record_fetch(10, 1_000, 4);
        stats.record_fetch(6, 500, 2);
        stats.record_emitted(4);
        stats.record_filter_errors(1);

        let snap = stats.snapshot();
        assert_eq!(snap.fetches, 2);
        assert_eq!(snap.messages_consumed, 16);
        assert_eq!(snap.bytes_consumed, 1_500);
        assert_eq!(snap.elapsed_ms, 6);
        assert_eq!(snap.filter_apply_errors, 1);
        assert!((snap.match_percent() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_reset() {
        let stats = ConsumingStats::new();
        stats.record_fetch(1, 1, 1);
        stats.mark_cancelled();
        stats.reset();
        assert_eq!(stats.snapshot(), ConsumingSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes() {
        let snap = ConsumingSnapshot {
            messages_consumed: 3,
            messages_emitted: 1,
            fetches: 1,
            ..ConsumingSnapshot::default()
        };
        insta::assert_json_snapshot!(snap, @r#"
        {
          "messages_consumed": 3,
          "bytes_consumed": 0,
          "messages_emitted": 1,
          "filter_apply_errors": 0,
          "fetches": 1,
          "elapsed_ms": 0,
          "cancelled": false
        }
        "#);
    }
}
