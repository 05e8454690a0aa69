//! Typed events and the bounded dispatch queue.
//!
//! Engines produce events from their own threads; observers consume
//! them on a thread the embedder controls, either the built-in
//! dispatcher thread or explicit polling. The queue is bounded and
//! drops its oldest entry on overflow, counting each drop.

use crate::core::ethernet::MacAddr;
use core::fmt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Discriminant for observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new peer appeared.
    PeerUp,

    /// A peer departed or timed out.
    PeerDown,

    /// A complete text message arrived.
    MessageReceived,

    /// An inbound file transfer awaits an accept/reject decision.
    FileOffer,

    /// Outbound transfer progress, reported per acknowledged fragment.
    FileProgress,

    /// An inbound file transfer finished.
    FileReceived,

    /// An outbound transfer completed with a clean digest.
    FileSendDone,

    /// An outbound transfer failed.
    FileSendFailed,

    /// The transport reported a send or receive failure.
    TransportError,
}

/// Accept/reject continuation carried by a file-offer event.
///
/// The first call wins; an undecided offer is auto-accepted once the
/// accept timeout passes.
#[derive(Clone, Default)]
pub struct OfferDecision {
    cell: Arc<Mutex<Option<bool>>>,
}

impl OfferDecision {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accepts the offered transfer.
    pub fn accept(&self) {
        self.cell.lock().unwrap().get_or_insert(true);
    }

    /// Rejects the offered transfer.
    pub fn reject(&self) {
        self.cell.lock().unwrap().get_or_insert(false);
    }

    pub(crate) fn get(&self) -> Option<bool> {
        *self.cell.lock().unwrap()
    }
}

impl fmt::Debug for OfferDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            None => f.write_str("OfferDecision(pending)"),
            Some(true) => f.write_str("OfferDecision(accept)"),
            Some(false) => f.write_str("OfferDecision(reject)"),
        }
    }
}

/// An event delivered to observers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new peer appeared.
    PeerUp {
        /// The peer's address.
        mac: MacAddr,
        /// Announced display name, if any.
        display_name: Option<String>,
    },

    /// A peer departed via GOODBYE or timed out.
    PeerDown {
        /// The peer's address.
        mac: MacAddr,
    },

    /// A complete text message arrived.
    MessageReceived {
        /// Sender address.
        source: MacAddr,
        /// Message text.
        text: String,
        /// Arrival timestamp of the completing fragment, Unix millis.
        timestamp: u64,
    },

    /// An inbound transfer awaits a decision.
    FileOffer {
        /// Sender address.
        source: MacAddr,
        /// Transfer identifier.
        msg_id: u32,
        /// Offered file name.
        filename: String,
        /// Offered file size in bytes.
        size: u64,
        /// Continuation; undecided offers auto-accept on timeout.
        decision: OfferDecision,
    },

    /// Outbound transfer progress.
    FileProgress {
        /// Transfer identifier.
        msg_id: u32,
        /// Bytes acknowledged so far.
        bytes_acked: u64,
        /// Total transfer size.
        bytes_total: u64,
    },

    /// An inbound transfer finished; `digest_ok` reports whether the
    /// content matched the offered digest.
    FileReceived {
        /// Sender address.
        source: MacAddr,
        /// Offered file name.
        filename: String,
        /// The reassembled file content.
        data: Arc<Vec<u8>>,
        /// Digest verdict.
        digest_ok: bool,
    },

    /// An outbound transfer completed.
    FileSendDone {
        /// Transfer identifier.
        msg_id: u32,
    },

    /// An outbound transfer failed.
    FileSendFailed {
        /// Transfer identifier.
        msg_id: u32,
        /// Human-readable failure cause.
        reason: String,
    },

    /// The transport reported a failure after startup.
    TransportError {
        /// Failure description.
        detail: String,
    },
}

impl Event {
    /// Returns the discriminant used for observer registration.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PeerUp { .. } => EventKind::PeerUp,
            Event::PeerDown { .. } => EventKind::PeerDown,
            Event::MessageReceived { .. } => EventKind::MessageReceived,
            Event::FileOffer { .. } => EventKind::FileOffer,
            Event::FileProgress { .. } => EventKind::FileProgress,
            Event::FileReceived { .. } => EventKind::FileReceived,
            Event::FileSendDone { .. } => EventKind::FileSendDone,
            Event::FileSendFailed { .. } => EventKind::FileSendFailed,
            Event::TransportError { .. } => EventKind::TransportError,
        }
    }
}

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

struct Observer {
    id: u64,
    kind: EventKind,
    callback: Callback,
}

struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

/// Bounded event queue with per-kind observers.
pub struct Dispatcher {
    state: Mutex<QueueState>,
    cond: Condvar,
    capacity: usize,
    observers: Mutex<Vec<Observer>>,
    next_observer_id: AtomicU64,
    overflow: AtomicU64,
}

impl Dispatcher {
    /// Creates a dispatcher with the given queue capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            capacity: capacity.max(1),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            overflow: AtomicU64::new(0),
        }
    }

    /// Registers a callback for one event kind. Returns an id for
    /// [`unobserve`](Self::unobserve).
    pub fn observe(&self, kind: EventKind, callback: impl Fn(&Event) + Send + Sync + 'static) -> u64 {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().unwrap().push(Observer {
            id,
            kind,
            callback: Box::new(callback),
        });
        id
    }

    /// Removes a previously registered callback.
    pub fn unobserve(&self, id: u64) {
        self.observers.lock().unwrap().retain(|o| o.id != id);
    }

    /// Enqueues an event, dropping the oldest entry when full.
    pub(crate) fn emit(&self, event: Event) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }

        if state.events.len() >= self.capacity {
            state.events.pop_front();
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        state.events.push_back(event);
        drop(state);

        self.cond.notify_one();
    }

    /// Waits up to `timeout` for an event, invokes the matching
    /// callbacks, and returns it. Returns `None` on timeout or once
    /// the queue is closed and drained.
    pub fn poll(&self, timeout: Duration) -> Option<Event> {
        let mut state = self.state.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;

        loop {
            if let Some(event) = state.events.pop_front() {
                drop(state);
                self.dispatch(&event);
                return Some(event);
            }

            if state.closed {
                return None;
            }

            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let (next, _) = self.cond.wait_timeout(state, remaining).unwrap();
            state = next;
        }
    }

    /// Marks the queue closed and wakes every waiter. Queued events
    /// remain pollable.
    pub(crate) fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_drained(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.closed && state.events.is_empty()
    }

    /// Number of events dropped to overflow.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    fn dispatch(&self, event: &Event) {
        let observers = self.observers.lock().unwrap();
        let kind = event.kind();
        for observer in observers.iter().filter(|o| o.kind == kind) {
            (observer.callback)(event);
        }
    }
}
