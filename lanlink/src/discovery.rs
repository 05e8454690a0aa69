//! Peer discovery: HELLO broadcasts, unicast HELLO-ACK replies,
//! GOODBYE handling and the liveness sweep.

use crate::core::ethernet::MacAddr;
use crate::core::pdu::{MsgIdGen, Pdu, MAX_DISPLAY_NAME};
use crate::error::Result;
use crate::event::{Dispatcher, Event};
use crate::peer::{PeerRecord, PeerTable};
use crate::transport::{send_pdu, FrameTransport};
use std::sync::{Arc, Mutex};

pub(crate) struct DiscoveryEngine {
    link: Arc<dyn FrameTransport>,
    events: Arc<Dispatcher>,
    peers: Mutex<PeerTable>,
    msg_ids: MsgIdGen,
    display_name: Option<String>,
}

impl DiscoveryEngine {
    pub(crate) fn new(
        link: Arc<dyn FrameTransport>,
        events: Arc<Dispatcher>,
        msg_ids: MsgIdGen,
        display_name: Option<String>,
    ) -> Self {
        Self {
            link,
            events,
            peers: Mutex::new(PeerTable::new()),
            msg_ids,
            display_name,
        }
    }

    fn name_payload(&self) -> Vec<u8> {
        self.display_name
            .as_deref()
            .map(|name| truncate_name(name).to_vec())
            .unwrap_or_default()
    }

    /// Announces this node to the whole segment.
    pub(crate) fn broadcast_hello(&self) -> Result<()> {
        let payload = self.name_payload();
        let pdu = Pdu::hello(self.msg_ids.next(), &payload);
        send_pdu(self.link.as_ref(), MacAddr::BROADCAST, &pdu)
    }

    /// Announces departure. Sent once at shutdown.
    pub(crate) fn broadcast_goodbye(&self) -> Result<()> {
        let pdu = Pdu::goodbye(self.msg_ids.next());
        send_pdu(self.link.as_ref(), MacAddr::BROADCAST, &pdu)
    }

    pub(crate) fn handle_hello(&self, src: MacAddr, pdu: &Pdu<'_>, now: u64) {
        let name = parse_name(pdu.payload);
        let newcomer = self.peers.lock().unwrap().observe(src, name.clone(), now);

        if newcomer {
            log::info!("peer up: {src} ({})", name.as_deref().unwrap_or("unnamed"));
            self.events.emit(Event::PeerUp {
                mac: src,
                display_name: name,
            });

            // Introduce ourselves to the newcomer directly.
            let payload = self.name_payload();
            let ack = Pdu::hello_ack(self.msg_ids.next(), &payload);
            if let Err(err) = send_pdu(self.link.as_ref(), src, &ack) {
                log::warn!("hello-ack to {src} failed: {err}");
            }
        }
    }

    pub(crate) fn handle_hello_ack(&self, src: MacAddr, pdu: &Pdu<'_>, now: u64) {
        let name = parse_name(pdu.payload);
        let newcomer = self.peers.lock().unwrap().observe(src, name.clone(), now);

        if newcomer {
            log::info!("peer up (ack): {src}");
            self.events.emit(Event::PeerUp {
                mac: src,
                display_name: name,
            });
        }
    }

    pub(crate) fn handle_goodbye(&self, src: MacAddr) {
        if self.peers.lock().unwrap().remove(src).is_some() {
            log::info!("peer departed: {src}");
            self.events.emit(Event::PeerDown { mac: src });
        }
    }

    /// Applies the liveness thresholds and emits peer-down for every
    /// removed peer. Returns the removed addresses so transfers to
    /// them can be failed.
    pub(crate) fn sweep(&self, now: u64, stale_ms: u64, dead_ms: u64) -> Vec<MacAddr> {
        let dead = self.peers.lock().unwrap().sweep(now, stale_ms, dead_ms);

        for mac in &dead {
            log::info!("peer timed out: {mac}");
            self.events.emit(Event::PeerDown { mac: *mac });
        }

        dead
    }

    pub(crate) fn peers(&self) -> Vec<PeerRecord> {
        self.peers.lock().unwrap().snapshot()
    }
}

fn parse_name(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        return None;
    }
    core::str::from_utf8(payload).ok().map(str::to_owned)
}

fn truncate_name(name: &str) -> &[u8] {
    if name.len() <= MAX_DISPLAY_NAME {
        return name.as_bytes();
    }

    let mut end = MAX_DISPLAY_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name.as_bytes()[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ethernet::{EthernetFrame, MAX_FRAME_LEN};
    use crate::core::pdu::PduType;
    use crate::event::EventKind;
    use crate::transport::TestHub;
    use std::time::Duration;

    const PEER: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xBB]);

    fn engine(hub: &TestHub) -> (DiscoveryEngine, Arc<Dispatcher>) {
        let link = Arc::new(hub.link(MacAddr([0x02, 0, 0, 0, 0, 0xAA])));
        let events = Arc::new(Dispatcher::new(64));
        let engine = DiscoveryEngine::new(
            link,
            Arc::clone(&events),
            MsgIdGen::new(),
            Some("alpha".to_owned()),
        );
        (engine, events)
    }

    fn recv_pdu_type(link: &dyn FrameTransport) -> Option<PduType> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = link.recv(&mut buf).unwrap()?;
        let frame = EthernetFrame::deserialize(&buf[..n]).unwrap();
        Some(Pdu::deserialize(frame.payload).unwrap().pdu_type)
    }

    #[test]
    fn test_hello_inserts_and_acks() {
        let hub = TestHub::new();
        let (engine, events) = engine(&hub);
        let peer_link = hub.link(PEER);

        engine.handle_hello(PEER, &Pdu::hello(1, b"beta"), 1_000);

        assert_eq!(engine.peers().len(), 1);
        assert_eq!(
            events.poll(Duration::from_millis(10)).unwrap().kind(),
            EventKind::PeerUp
        );
        assert_eq!(recv_pdu_type(&peer_link), Some(PduType::HelloAck));

        // A repeat HELLO refreshes silently.
        engine.handle_hello(PEER, &Pdu::hello(2, b"beta"), 2_000);
        assert!(events.poll(Duration::from_millis(1)).is_none());
        assert!(recv_pdu_type(&peer_link).is_none());
    }

    #[test]
    fn test_hello_ack_does_not_reply() {
        let hub = TestHub::new();
        let (engine, events) = engine(&hub);
        let peer_link = hub.link(PEER);

        engine.handle_hello_ack(PEER, &Pdu::hello_ack(1, b""), 1_000);

        assert_eq!(engine.peers().len(), 1);
        assert_eq!(
            events.poll(Duration::from_millis(10)).unwrap().kind(),
            EventKind::PeerUp
        );
        assert!(recv_pdu_type(&peer_link).is_none());
    }

    #[test]
    fn test_goodbye_removes_peer() {
        let hub = TestHub::new();
        let (engine, events) = engine(&hub);

        engine.handle_hello(PEER, &Pdu::hello(1, b""), 1_000);
        let _ = events.poll(Duration::from_millis(10));

        engine.handle_goodbye(PEER);
        assert!(engine.peers().is_empty());
        assert_eq!(
            events.poll(Duration::from_millis(10)).unwrap().kind(),
            EventKind::PeerDown
        );

        // Unknown peers are ignored.
        engine.handle_goodbye(PEER);
        assert!(events.poll(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_sweep_emits_peer_down_once() {
        let hub = TestHub::new();
        let (engine, events) = engine(&hub);

        engine.handle_hello(PEER, &Pdu::hello(1, b""), 0);
        let _ = events.poll(Duration::from_millis(10));

        assert!(engine.sweep(20_000, 15_000, 30_000).is_empty());
        let dead = engine.sweep(30_000, 15_000, 30_000);
        assert_eq!(dead, vec![PEER]);

        assert_eq!(
            events.poll(Duration::from_millis(10)).unwrap().kind(),
            EventKind::PeerDown
        );
        assert!(engine.sweep(60_000, 15_000, 30_000).is_empty());
    }

    #[test]
    fn test_name_truncation_respects_char_boundary() {
        let name = "é".repeat(40); // 80 bytes
        let truncated = truncate_name(&name);
        assert!(truncated.len() <= MAX_DISPLAY_NAME);
        assert!(core::str::from_utf8(truncated).is_ok());
    }
}
