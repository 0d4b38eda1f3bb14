//! Flush-run bookkeeping for display and monitor output.
//!
//! Display messages are published individually, but consumers need to know
//! when a contiguous run of output is complete without waiting for a
//! timeout. The tracker remembers where the current unflushed run started
//! and where the last flush happened; the session uses it to decide whether
//! a flush marker closes a real run or is dropped, and to stamp flush
//! records with the run's starting id.
//!
//! All comparisons use wrapping arithmetic: the message counter is a `u32`
//! that wraps on overflow, and a long-lived agent must survive that.

/// Bookkeeping for one stream of flushable output.
#[derive(Debug, Clone, Copy)]
pub struct FlushTracker {
    /// Counter id of the first message in the current unflushed run.
    run_start: u32,
    /// Counter id of the last flush boundary (explicit or self-flushing).
    last_flush: u32,
}

/// `true` when `a` is strictly ahead of `b` in wrapping counter order.
fn ahead_of(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

impl FlushTracker {
    pub fn new() -> Self {
        Self { run_start: 0, last_flush: 0 }
    }

    /// Starting id of the current run, for stamping into a flush record.
    pub fn run_start(&self) -> u32 {
        self.run_start
    }

    /// A run is empty when its start is not ahead of the last flush —
    /// nothing has been published since the last boundary.
    pub fn run_is_empty(&self) -> bool {
        !ahead_of(self.run_start, self.last_flush)
    }

    /// Record a published value-bearing message.
    ///
    /// A message arriving after a flush boundary starts a new run at its own
    /// id. A self-flushing message also closes its own run.
    pub fn note_value(&mut self, id: u32, self_flushing: bool) {
        if self.run_is_empty() {
            self.run_start = id;
        }
        if self_flushing {
            self.last_flush = id;
        }
    }

    /// Record a published flush record.
    pub fn note_flush(&mut self, id: u32) {
        self.last_flush = id;
    }
}

impl Default for FlushTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_has_empty_run() {
        let tracker = FlushTracker::new();
        assert!(tracker.run_is_empty());
    }

    #[test]
    fn run_starts_at_first_value() {
        let mut tracker = FlushTracker::new();
        tracker.note_value(5, false);
        tracker.note_value(6, false);
        tracker.note_value(7, false);
        assert!(!tracker.run_is_empty());
        assert_eq!(tracker.run_start(), 5);
    }

    #[test]
    fn flush_closes_run_and_next_value_starts_new_one() {
        let mut tracker = FlushTracker::new();
        tracker.note_value(1, false);
        tracker.note_value(2, false);
        tracker.note_flush(3);
        assert!(tracker.run_is_empty(), "flush at 3 closed the run from 1");

        tracker.note_value(4, false);
        assert_eq!(tracker.run_start(), 4);
        assert!(!tracker.run_is_empty());
    }

    #[test]
    fn self_flushing_closes_run_spanning_prior_fragments() {
        // Three flush-less fragments then a self-flushing result: one
        // boundary, spanning all four messages.
        let mut tracker = FlushTracker::new();
        tracker.note_value(1, false);
        tracker.note_value(2, false);
        tracker.note_value(3, false);
        assert_eq!(tracker.run_start(), 1);
        tracker.note_value(4, true);
        assert!(tracker.run_is_empty(), "result closed the whole run");
    }

    #[test]
    fn back_to_back_flushes_leave_empty_run() {
        let mut tracker = FlushTracker::new();
        tracker.note_value(1, false);
        tracker.note_flush(2);
        // No values since the boundary: a second flush would close nothing.
        assert!(tracker.run_is_empty());
    }

    #[test]
    fn survives_counter_wraparound() {
        let mut tracker = FlushTracker::new();
        tracker.note_flush(u32::MAX - 1);
        tracker.note_value(u32::MAX, false);
        assert_eq!(tracker.run_start(), u32::MAX);
        assert!(!tracker.run_is_empty());

        tracker.note_value(0, false);
        tracker.note_flush(1);
        assert!(tracker.run_is_empty());
        tracker.note_value(2, false);
        assert_eq!(tracker.run_start(), 2);
    }
}
