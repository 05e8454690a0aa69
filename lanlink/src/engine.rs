//! Engine orchestration.
//!
//! [`LinkEngine`] is the single shared instance per process: it owns
//! the receive, discovery, scheduler and (optionally) dispatcher
//! threads, demuxes inbound PDUs to the engines, and exposes the
//! public operations. Dropping the handle stops everything.

use crate::config::{Config, Delivery};
use crate::core::ethernet::{EthernetFrame, MacAddr, ETHERTYPE};
use crate::core::pdu::{MsgIdGen, Pdu, PduType};
use crate::discovery::DiscoveryEngine;
use crate::error::{Error, Result};
use crate::event::{Dispatcher, Event, EventKind};
use crate::messaging::MessagingEngine;
use crate::peer::PeerRecord;
use crate::transfer::TransferEngine;
use crate::transport::FrameTransport;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Receive buffer size; anything past the frame length is ignored.
const RX_BUF_LEN: usize = 2048;

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared engine counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub frames_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub reassembly_expired: AtomicU64,
    pub duplicate_fragments: AtomicU64,
}

/// Snapshot of engine statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    /// Protocol frames accepted by the demux.
    pub frames_received: u64,

    /// Frames discarded by the frame or PDU codec.
    pub parse_errors: u64,

    /// Fragments or payloads that violated protocol invariants.
    pub protocol_errors: u64,

    /// Reassembly slots evicted by the sweep.
    pub reassembly_expired: u64,

    /// Duplicate file fragments that were re-acknowledged.
    pub duplicate_fragments: u64,

    /// Events dropped by the bounded queue.
    pub dispatcher_overflow: u64,
}

struct EngineInner {
    link: Arc<dyn FrameTransport>,
    config: Config,
    dispatcher: Arc<Dispatcher>,
    discovery: DiscoveryEngine,
    messaging: MessagingEngine,
    transfers: TransferEngine,
    counters: Arc<Counters>,
    stop: AtomicBool,
}

impl EngineInner {
    /// Decodes one wire frame and routes its PDU. Runs on the receive
    /// thread; never invokes observer callbacks directly.
    fn handle_frame(&self, bytes: &[u8], now: u64) {
        let frame = match EthernetFrame::deserialize(bytes) {
            Ok(frame) => frame,
            Err(_) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if frame.ethertype != ETHERTYPE {
            return;
        }

        let local = self.link.local_mac();
        if frame.src == local {
            // A reflected broadcast must not become a self-peer.
            return;
        }
        if frame.dst != local && !frame.dst.is_broadcast() {
            return;
        }

        let pdu = match Pdu::deserialize(frame.payload) {
            Ok(pdu) => pdu,
            Err(err) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                log::trace!("dropping frame from {}: {err}", frame.src);
                return;
            }
        };

        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);

        match pdu.pdu_type {
            PduType::Hello => self.discovery.handle_hello(frame.src, &pdu, now),
            PduType::HelloAck => self.discovery.handle_hello_ack(frame.src, &pdu, now),
            PduType::Goodbye => self.discovery.handle_goodbye(frame.src),
            PduType::Text => self.messaging.handle_text(frame.src, &pdu, now),
            PduType::FileOffer => self.transfers.handle_offer(frame.src, &pdu, now),
            PduType::FileData => self.transfers.handle_data(frame.src, &pdu, now),
            PduType::FileAck => self.transfers.handle_ack(frame.src, &pdu, now),
            PduType::FileComplete => self.transfers.handle_complete(frame.src, &pdu),
        }
    }

    fn rx_loop(&self) {
        let mut buf = [0u8; RX_BUF_LEN];

        while !self.stop.load(Ordering::Relaxed) {
            match self.link.recv(&mut buf) {
                Ok(Some(n)) => self.handle_frame(&buf[..n], now_ms()),
                Ok(None) => {}
                Err(err) => {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    log::error!("receive failed: {err}");
                    self.dispatcher.emit(Event::TransportError {
                        detail: err.to_string(),
                    });
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    fn discovery_loop(&self) {
        let tick = Duration::from_millis(self.config.scheduler_tick_ms.max(10));
        let mut next_hello = 0u64;
        let mut next_sweep = now_ms() + self.config.liveness_sweep_interval_ms;

        while !self.stop.load(Ordering::Relaxed) {
            let now = now_ms();

            if now >= next_hello {
                if let Err(err) = self.discovery.broadcast_hello() {
                    log::error!("hello broadcast failed: {err}");
                    self.dispatcher.emit(Event::TransportError {
                        detail: err.to_string(),
                    });
                }
                next_hello = now + self.config.hello_interval_ms;
            }

            if now >= next_sweep {
                let dead = self.discovery.sweep(
                    now,
                    self.config.peer_stale_after_ms,
                    self.config.peer_dead_after_ms,
                );
                for mac in dead {
                    self.transfers.peer_lost(mac);
                }
                next_sweep = now + self.config.liveness_sweep_interval_ms;
            }

            thread::sleep(tick);
        }
    }

    fn scheduler_loop(&self) {
        let tick = Duration::from_millis(self.config.scheduler_tick_ms.max(10));

        while !self.stop.load(Ordering::Relaxed) {
            let now = now_ms();
            self.transfers.tick(now);
            self.messaging.sweep(now);
            thread::sleep(tick);
        }
    }

    fn dispatcher_loop(&self) {
        loop {
            let delivered = self.dispatcher.poll(Duration::from_millis(200));
            if delivered.is_none() && self.dispatcher.is_drained() {
                break;
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stop.load(Ordering::Relaxed) {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }
}

/// Handle to a running protocol engine.
///
/// Construct one per process over a [`FrameTransport`]; the engine owns
/// its threads and stops on [`shutdown`](Self::shutdown) or drop.
pub struct LinkEngine {
    inner: Arc<EngineInner>,
    threads: Vec<JoinHandle<()>>,
}

impl LinkEngine {
    /// Starts the engine over an already-open transport.
    pub fn start(link: Arc<dyn FrameTransport>, config: Config) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(config.event_queue_capacity));
        let counters = Arc::new(Counters::default());
        let msg_ids = MsgIdGen::new();

        let discovery = DiscoveryEngine::new(
            Arc::clone(&link),
            Arc::clone(&dispatcher),
            msg_ids.clone(),
            config.display_name.clone(),
        );
        let messaging = MessagingEngine::new(
            Arc::clone(&link),
            Arc::clone(&dispatcher),
            msg_ids.clone(),
            Arc::clone(&counters),
            config.reassembly_timeout_ms,
        );
        let transfers = TransferEngine::new(
            Arc::clone(&link),
            Arc::clone(&dispatcher),
            config.clone(),
            msg_ids,
            Arc::clone(&counters),
        );

        let inner = Arc::new(EngineInner {
            link,
            config,
            dispatcher,
            discovery,
            messaging,
            transfers,
            counters,
            stop: AtomicBool::new(false),
        });

        let mut threads = Vec::new();

        let rx = Arc::clone(&inner);
        threads.push(
            thread::Builder::new()
                .name("lanlink-rx".to_owned())
                .spawn(move || rx.rx_loop())?,
        );

        let disc = Arc::clone(&inner);
        threads.push(
            thread::Builder::new()
                .name("lanlink-discovery".to_owned())
                .spawn(move || disc.discovery_loop())?,
        );

        let sched = Arc::clone(&inner);
        threads.push(
            thread::Builder::new()
                .name("lanlink-scheduler".to_owned())
                .spawn(move || sched.scheduler_loop())?,
        );

        if inner.config.delivery == Delivery::Background {
            let disp = Arc::clone(&inner);
            threads.push(
                thread::Builder::new()
                    .name("lanlink-events".to_owned())
                    .spawn(move || disp.dispatcher_loop())?,
            );
        }

        log::info!("engine started on {}", inner.link.local_mac());
        Ok(Self { inner, threads })
    }

    /// Opens a raw socket on `interface` and starts the engine over
    /// it. Requires link-layer privilege.
    #[cfg(target_os = "linux")]
    pub fn open(interface: &str, config: Config) -> Result<Self> {
        let link = Arc::new(crate::transport::RawSocket::open(interface)?);
        Self::start(link, config)
    }

    /// The local interface address.
    pub fn local_mac(&self) -> MacAddr {
        self.inner.link.local_mac()
    }

    /// Snapshot of the peer table. DEAD peers never appear.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.discovery.peers()
    }

    /// Sends a text message to one peer. Best-effort; returns the
    /// message id.
    pub fn send_text(&self, dest: MacAddr, text: &str) -> Result<u32> {
        self.inner.ensure_running()?;
        self.inner.messaging.send_text(dest, text)
    }

    /// Sends a text message to the whole segment.
    pub fn broadcast_text(&self, text: &str) -> Result<u32> {
        self.send_text(MacAddr::BROADCAST, text)
    }

    /// Offers a file from disk to `dest`. The returned transfer id
    /// reappears in progress and terminal events.
    pub fn send_file(&self, dest: MacAddr, path: impl AsRef<Path>) -> Result<u32> {
        self.inner.ensure_running()?;
        self.inner.transfers.send_file(dest, path.as_ref())
    }

    /// Offers in-memory content to `dest` under the given name.
    pub fn send_data(&self, dest: MacAddr, filename: &str, data: Vec<u8>) -> Result<u32> {
        self.inner.ensure_running()?;
        self.inner.transfers.send_data(dest, filename, data)
    }

    /// Registers an observer callback for one event kind.
    pub fn observe(
        &self,
        kind: EventKind,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> u64 {
        self.inner.dispatcher.observe(kind, callback)
    }

    /// Removes an observer.
    pub fn unobserve(&self, id: u64) {
        self.inner.dispatcher.unobserve(id);
    }

    /// Drains one event, invoking its callbacks. Intended for
    /// [`Delivery::Poll`]; under [`Delivery::Background`] the
    /// dispatcher thread usually wins the race for each event.
    pub fn poll_event(&self, timeout: Duration) -> Option<Event> {
        self.inner.dispatcher.poll(timeout)
    }

    /// Current engine statistics.
    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        EngineStats {
            frames_received: c.frames_received.load(Ordering::Relaxed),
            parse_errors: c.parse_errors.load(Ordering::Relaxed),
            protocol_errors: c.protocol_errors.load(Ordering::Relaxed),
            reassembly_expired: c.reassembly_expired.load(Ordering::Relaxed),
            duplicate_fragments: c.duplicate_fragments.load(Ordering::Relaxed),
            dispatcher_overflow: self.inner.dispatcher.overflow_count(),
        }
    }

    /// Stops every thread, fails in-flight transfers and broadcasts
    /// one GOODBYE. Idempotent.
    pub fn shutdown(&mut self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }

        log::info!("engine shutting down");
        self.inner.transfers.fail_all("engine shutdown");

        if let Err(err) = self.inner.discovery.broadcast_goodbye() {
            log::warn!("goodbye broadcast failed: {err}");
        }

        self.inner.dispatcher.close();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for LinkEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TestHub;

    fn quick_config() -> Config {
        Config::new()
            .with_hello_interval_ms(50)
            .with_liveness_ms(300, 600)
            .with_offer_retry(100, 2)
            .with_frag_retry(100, 3)
            .with_delivery(Delivery::Poll)
    }

    #[test]
    fn test_operations_rejected_after_shutdown() {
        let hub = TestHub::new();
        let link = Arc::new(hub.link(MacAddr([0x02, 0, 0, 0, 0, 1])));
        let mut engine = LinkEngine::start(link, quick_config()).unwrap();

        engine.shutdown();
        engine.shutdown(); // idempotent

        assert!(matches!(
            engine.send_text(MacAddr::BROADCAST, "hi"),
            Err(Error::Shutdown)
        ));
        assert!(matches!(
            engine.send_data(MacAddr([0x02, 0, 0, 0, 0, 2]), "f", vec![1]),
            Err(Error::Shutdown)
        ));
    }

    #[test]
    fn test_foreign_ethertype_ignored() {
        let hub = TestHub::new();
        let local = MacAddr([0x02, 0, 0, 0, 0, 1]);
        let link = Arc::new(hub.link(local));
        let other = hub.link(MacAddr([0x02, 0, 0, 0, 0, 2]));

        let engine = LinkEngine::start(link, quick_config()).unwrap();

        // A frame with a foreign EtherType never reaches the engines.
        let mut frame = EthernetFrame::new(local, MacAddr([0x02, 0, 0, 0, 0, 2]), &[0u8; 20]);
        frame.ethertype = 0x0800;
        let mut buf = [0u8; 128];
        let n = frame.serialize(&mut buf).unwrap();
        other.send(&buf[..n]).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(engine.stats().frames_received, 0);
        assert_eq!(engine.stats().parse_errors, 0);
    }

    #[test]
    fn test_goodbye_broadcast_on_shutdown() {
        let hub = TestHub::new();
        let a_mac = MacAddr([0x02, 0, 0, 0, 0, 1]);
        let a_link = Arc::new(hub.link(a_mac));
        let listener = hub.link(MacAddr([0x02, 0, 0, 0, 0, 2]));

        let mut engine = LinkEngine::start(a_link, quick_config()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        engine.shutdown();

        let mut saw_goodbye = false;
        let mut buf = [0u8; RX_BUF_LEN];
        while let Ok(Some(n)) = listener.recv(&mut buf) {
            let frame = EthernetFrame::deserialize(&buf[..n]).unwrap();
            if let Ok(pdu) = Pdu::deserialize(frame.payload) {
                if pdu.pdu_type == PduType::Goodbye {
                    saw_goodbye = true;
                }
            }
        }
        assert!(saw_goodbye);
    }
}
