//! Sliding window over the fragments of one outbound transfer.
//!
//! Tracks which fragments are in flight, which are acknowledged, and
//! which have waited long enough to be retransmitted. The window
//! carries bookkeeping only; fragment bytes live with the transfer
//! record.

/// Per-fragment tracking state.
#[derive(Debug, Clone, Copy)]
struct FragmentSlot {
    /// Timestamp of the most recent transmission.
    last_sent: u64,

    /// Number of transmissions so far.
    attempts: u8,

    /// Whether an ACK has been received.
    acked: bool,

    /// Whether the fragment has been transmitted at least once.
    sent: bool,
}

impl FragmentSlot {
    const fn new() -> Self {
        Self {
            last_sent: 0,
            attempts: 0,
            acked: false,
            sent: false,
        }
    }
}

/// Send window for one transfer.
#[derive(Debug)]
pub struct SendWindow {
    slots: Vec<FragmentSlot>,

    /// Maximum unacknowledged fragments in flight.
    window: usize,

    /// Next fragment index that has never been sent.
    next_unsent: usize,

    /// Fragments sent and not yet acknowledged.
    in_flight: usize,

    /// Fragments acknowledged.
    acked: usize,
}

impl SendWindow {
    /// Creates a window over `total` fragments with at most `window`
    /// outstanding.
    pub fn new(total: u16, window: usize) -> Self {
        Self {
            slots: vec![FragmentSlot::new(); total as usize],
            window: window.max(1),
            next_unsent: 0,
            in_flight: 0,
            acked: 0,
        }
    }

    /// Returns the total fragment count.
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of acknowledged fragments.
    pub fn acked_count(&self) -> usize {
        self.acked
    }

    /// Returns the number of unacknowledged fragments in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Returns true once every fragment is acknowledged.
    pub fn is_complete(&self) -> bool {
        self.acked == self.slots.len()
    }

    /// Returns the fragment indices that should be transmitted now to
    /// fill the window. The caller must report each transmission via
    /// [`mark_sent`](Self::mark_sent).
    pub fn sendable(&self) -> Vec<u16> {
        let room = self.window.saturating_sub(self.in_flight);
        (self.next_unsent..self.slots.len())
            .take(room)
            .map(|i| i as u16)
            .collect()
    }

    /// Records a transmission of `index`.
    pub fn mark_sent(&mut self, index: u16, now: u64) {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };

        if !slot.sent {
            slot.sent = true;
            self.in_flight += 1;
            self.next_unsent = self.next_unsent.max(index as usize + 1);
        }
        slot.last_sent = now;
        slot.attempts = slot.attempts.saturating_add(1);
    }

    /// Acknowledges `index`. Returns true when this was the first ACK
    /// for the fragment.
    pub fn ack(&mut self, index: u16) -> bool {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return false;
        };

        if !slot.sent || slot.acked {
            return false;
        }

        slot.acked = true;
        self.acked += 1;
        self.in_flight -= 1;
        true
    }

    /// Finds in-flight fragments whose retransmit interval elapsed.
    ///
    /// Invokes `callback(index, exceeded)` for each; `exceeded` is true
    /// when the fragment has already used up `max_retries`
    /// retransmissions.
    pub fn check_timeouts<F>(&self, now: u64, interval_ms: u64, max_retries: u8, mut callback: F)
    where
        F: FnMut(u16, bool),
    {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.sent && !slot.acked && now.saturating_sub(slot.last_sent) >= interval_ms {
                // The first transmission is not a retry.
                let exceeded = slot.attempts > max_retries;
                callback(i as u16, exceeded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_limits_in_flight() {
        let mut window = SendWindow::new(10, 4);

        let first = window.sendable();
        assert_eq!(first, vec![0, 1, 2, 3]);
        for i in first {
            window.mark_sent(i, 100);
        }

        assert!(window.sendable().is_empty());
        assert_eq!(window.in_flight(), 4);
    }

    #[test]
    fn test_ack_advances_window() {
        let mut window = SendWindow::new(10, 4);
        for i in window.sendable() {
            window.mark_sent(i, 100);
        }

        assert!(window.ack(1));
        assert_eq!(window.sendable(), vec![4]);
        assert_eq!(window.acked_count(), 1);
    }

    #[test]
    fn test_duplicate_ack_ignored() {
        let mut window = SendWindow::new(2, 2);
        for i in window.sendable() {
            window.mark_sent(i, 0);
        }

        assert!(window.ack(0));
        assert!(!window.ack(0));
        assert!(!window.ack(7));
        assert_eq!(window.acked_count(), 1);
    }

    #[test]
    fn test_complete() {
        let mut window = SendWindow::new(3, 16);
        for i in window.sendable() {
            window.mark_sent(i, 0);
        }
        for i in 0..3 {
            window.ack(i);
        }
        assert!(window.is_complete());
        assert_eq!(window.in_flight(), 0);
    }

    #[test]
    fn test_timeout_detection() {
        let mut window = SendWindow::new(2, 2);
        for i in window.sendable() {
            window.mark_sent(i, 0);
        }
        window.ack(1);

        let mut due = Vec::new();
        window.check_timeouts(500, 1_000, 5, |i, ex| due.push((i, ex)));
        assert!(due.is_empty());

        window.check_timeouts(1_000, 1_000, 5, |i, ex| due.push((i, ex)));
        assert_eq!(due, vec![(0, false)]);
    }

    #[test]
    fn test_retry_ceiling() {
        let mut window = SendWindow::new(1, 1);

        // Initial transmission plus two retries.
        window.mark_sent(0, 0);
        window.mark_sent(0, 1_000);
        window.mark_sent(0, 2_000);

        let mut exceeded = false;
        window.check_timeouts(3_000, 1_000, 2, |_, ex| exceeded = ex);
        assert!(exceeded);

        exceeded = false;
        window.check_timeouts(3_000, 1_000, 3, |_, ex| exceeded = ex);
        assert!(!exceeded);
    }
}
