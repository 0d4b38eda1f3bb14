//! Inbound message deduplication.
//!
//! The broker delivers at-least-once; command handlers (run in particular)
//! are not safe to repeat blindly. A fixed ring of the most recently
//! accepted message ids rejects redeliveries. Membership is exact within the
//! window; an id becomes acceptable again once `WINDOW` newer distinct ids
//! have arrived.

/// Window capacity. Power of two so the write index wraps with a mask.
const WINDOW: usize = 4;

/// Fixed-capacity ring of recently accepted inbound message ids.
#[derive(Debug, Default)]
pub struct DedupWindow {
    seen: [Option<u32>; WINDOW],
    next: usize,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept or reject an inbound id.
    ///
    /// Returns `false` if the id is present in the window. Otherwise inserts
    /// it, evicting the oldest slot, and returns `true`.
    pub fn accept(&mut self, id: u32) -> bool {
        if self.seen.contains(&Some(id)) {
            return false;
        }
        self.seen[self.next] = Some(id);
        self.next = (self.next + 1) & (WINDOW - 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_recent_repeats() {
        let mut window = DedupWindow::new();
        for id in [10, 11, 12, 13] {
            assert!(window.accept(id));
        }
        for id in [10, 11, 12, 13] {
            assert!(!window.accept(id), "id {id} should still be remembered");
        }
    }

    #[test]
    fn oldest_evicted_after_window_fills() {
        let mut window = DedupWindow::new();
        for id in [1, 2, 3, 4] {
            assert!(window.accept(id));
        }
        // A fifth distinct id evicts the oldest slot.
        assert!(window.accept(5));
        assert!(window.accept(1), "evicted id is acceptable again");
        assert!(!window.accept(3), "ids still in the window stay rejected");
    }

    #[test]
    fn zero_id_not_preoccupied() {
        // Fresh windows must not confuse empty slots with a real id of 0.
        let mut window = DedupWindow::new();
        assert!(window.accept(0));
        assert!(!window.accept(0));
    }
}
