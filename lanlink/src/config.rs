//! Engine configuration.
//!
//! All timing parameters are expressed in milliseconds so the state
//! machines can compare them against plain `u64` timestamps.

/// How events reach observer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// A dedicated dispatcher thread drains the queue.
    #[default]
    Background,

    /// The embedder drains the queue by calling `poll_event`.
    Poll,
}

/// Configuration for the protocol engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Display name announced in HELLO broadcasts (at most 64 bytes).
    pub display_name: Option<String>,

    /// Period of HELLO broadcasts.
    pub hello_interval_ms: u64,

    /// A peer silent for this long is marked STALE.
    pub peer_stale_after_ms: u64,

    /// A peer silent for this long is removed as DEAD.
    pub peer_dead_after_ms: u64,

    /// Period of the peer liveness sweep.
    pub liveness_sweep_interval_ms: u64,

    /// Incomplete inbound messages are dropped after this long.
    pub reassembly_timeout_ms: u64,

    /// Maximum outstanding unacknowledged file fragments per transfer.
    pub file_window: usize,

    /// Per-fragment retransmit period.
    pub file_frag_retry_interval_ms: u64,

    /// Fragment retry ceiling.
    pub file_frag_max_retries: u8,

    /// FILE-OFFER retransmit period.
    pub file_offer_retry_interval_ms: u64,

    /// FILE-OFFER retry ceiling.
    pub file_offer_max_retries: u8,

    /// How long a sender waits for FILE-COMPLETE after the last ACK.
    pub file_complete_timeout_ms: u64,

    /// A receiver making no progress for this long drops the transfer.
    pub file_recv_stall_timeout_ms: u64,

    /// How long a FILE-OFFER waits for an observer decision before
    /// the default accept applies.
    pub file_accept_timeout_ms: u64,

    /// Capacity of the event queue; the oldest event is dropped on
    /// overflow.
    pub event_queue_capacity: usize,

    /// Granularity of the retransmission/stall scheduler.
    pub scheduler_tick_ms: u64,

    /// Event delivery mode.
    pub delivery: Delivery,
}

impl Config {
    /// Creates a configuration with the protocol defaults.
    pub fn new() -> Self {
        Self {
            display_name: None,
            hello_interval_ms: 5_000,
            peer_stale_after_ms: 15_000,
            peer_dead_after_ms: 30_000,
            liveness_sweep_interval_ms: 5_000,
            reassembly_timeout_ms: 30_000,
            file_window: 16,
            file_frag_retry_interval_ms: 1_000,
            file_frag_max_retries: 5,
            file_offer_retry_interval_ms: 2_000,
            file_offer_max_retries: 3,
            file_complete_timeout_ms: 10_000,
            file_recv_stall_timeout_ms: 30_000,
            file_accept_timeout_ms: 2_000,
            event_queue_capacity: 1024,
            scheduler_tick_ms: 100,
            delivery: Delivery::Background,
        }
    }

    /// Sets the announced display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the HELLO broadcast period.
    pub fn with_hello_interval_ms(mut self, ms: u64) -> Self {
        self.hello_interval_ms = ms;
        self
    }

    /// Sets the STALE and DEAD liveness thresholds.
    pub fn with_liveness_ms(mut self, stale_ms: u64, dead_ms: u64) -> Self {
        self.peer_stale_after_ms = stale_ms;
        self.peer_dead_after_ms = dead_ms;
        self
    }

    /// Sets the file transfer send window.
    pub fn with_file_window(mut self, window: usize) -> Self {
        self.file_window = window;
        self
    }

    /// Sets the per-fragment retransmit period and ceiling.
    pub fn with_frag_retry(mut self, interval_ms: u64, max_retries: u8) -> Self {
        self.file_frag_retry_interval_ms = interval_ms;
        self.file_frag_max_retries = max_retries;
        self
    }

    /// Sets the FILE-OFFER retransmit period and ceiling.
    pub fn with_offer_retry(mut self, interval_ms: u64, max_retries: u8) -> Self {
        self.file_offer_retry_interval_ms = interval_ms;
        self.file_offer_max_retries = max_retries;
        self
    }

    /// Sets the event queue capacity.
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Sets the event delivery mode.
    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.hello_interval_ms, 5_000);
        assert_eq!(config.peer_dead_after_ms, 30_000);
        assert_eq!(config.file_window, 16);
        assert_eq!(config.file_frag_max_retries, 5);
        assert_eq!(config.event_queue_capacity, 1024);
        assert_eq!(config.delivery, Delivery::Background);
    }

    #[test]
    fn test_builder() {
        let config = Config::new()
            .with_display_name("workbench")
            .with_hello_interval_ms(1_000)
            .with_file_window(32)
            .with_frag_retry(500, 3)
            .with_delivery(Delivery::Poll);

        assert_eq!(config.display_name.as_deref(), Some("workbench"));
        assert_eq!(config.hello_interval_ms, 1_000);
        assert_eq!(config.file_window, 32);
        assert_eq!(config.file_frag_retry_interval_ms, 500);
        assert_eq!(config.file_frag_max_retries, 3);
        assert_eq!(config.delivery, Delivery::Poll);
    }
}
