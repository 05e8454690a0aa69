//! File transfer engine: offer/accept negotiation, windowed fragment
//! streaming with per-fragment acknowledgment and retransmission, and
//! digest verification.

mod inbound;
mod outbound;

use crate::config::Config;
use crate::core::ethernet::MacAddr;
use crate::core::pdu::{
    FileAck, FileComplete, FileOffer, MsgIdGen, Pdu, OFFER_ACCEPT_FRAG,
};
use crate::engine::{now_ms, Counters};
use crate::error::Result;
use crate::event::{Dispatcher, Event, OfferDecision};
use crate::transport::{send_pdu, FrameTransport};
use inbound::{InboundState, InboundTick, InboundTransfer};
use outbound::{OutboundState, OutboundTransfer};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

pub(crate) struct TransferEngine {
    link: Arc<dyn FrameTransport>,
    events: Arc<Dispatcher>,
    config: Config,
    msg_ids: MsgIdGen,
    counters: Arc<Counters>,
    outbound: Mutex<HashMap<u32, OutboundTransfer>>,
    inbound: Mutex<HashMap<(MacAddr, u32), InboundTransfer>>,
}

impl TransferEngine {
    pub(crate) fn new(
        link: Arc<dyn FrameTransport>,
        events: Arc<Dispatcher>,
        config: Config,
        msg_ids: MsgIdGen,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            link,
            events,
            config,
            msg_ids,
            counters,
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
        }
    }

    /// Reads `path` and offers it to `dest`. Returns the transfer id.
    pub(crate) fn send_file(&self, dest: MacAddr, path: &Path) -> Result<u32> {
        let data = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        self.send_data(dest, &filename, data)
    }

    /// Offers in-memory content to `dest`. Returns the transfer id.
    pub(crate) fn send_data(&self, dest: MacAddr, filename: &str, data: Vec<u8>) -> Result<u32> {
        let now = now_ms();
        let msg_id = self.msg_ids.next();

        let transfer =
            OutboundTransfer::new(msg_id, dest, filename, data, self.config.file_window, now)?;
        let offer = transfer.offer().encode();

        log::info!(
            "offering {filename} to {dest}: {} bytes in {} fragments, sha256 {}",
            transfer.bytes_total,
            transfer.frag_total(),
            hex::encode(transfer.digest),
        );

        send_pdu(self.link.as_ref(), dest, &Pdu::file_offer(msg_id, &offer))?;
        self.outbound.lock().unwrap().insert(msg_id, transfer);
        Ok(msg_id)
    }

    pub(crate) fn handle_offer(&self, src: MacAddr, pdu: &Pdu<'_>, now: u64) {
        let offer = match FileOffer::decode(pdu.payload) {
            Ok(offer) => offer,
            Err(err) => {
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("bad file offer from {src}: {err}");
                return;
            }
        };

        let key = (src, pdu.msg_id);
        let decision = OfferDecision::new();
        {
            let mut inbound = self.inbound.lock().unwrap();

            if let Some(existing) = inbound.get(&key) {
                // Retransmitted offer: our acceptance may have been
                // lost, so repeat it.
                let reaccept = existing.state == InboundState::Receiving;
                drop(inbound);
                if reaccept {
                    self.send_ack(src, pdu.msg_id, OFFER_ACCEPT_FRAG);
                }
                return;
            }

            let transfer = match InboundTransfer::new(
                pdu.msg_id,
                src,
                &offer,
                decision.clone(),
                now,
                self.config.file_accept_timeout_ms,
            ) {
                Ok(transfer) => transfer,
                Err(err) => {
                    self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    log::debug!("unusable file offer from {src}: {err}");
                    return;
                }
            };
            inbound.insert(key, transfer);
        }

        log::info!(
            "file offer from {src}: {} ({} bytes)",
            offer.filename,
            offer.file_size
        );

        self.events.emit(Event::FileOffer {
            source: src,
            msg_id: pdu.msg_id,
            filename: offer.filename,
            size: offer.file_size,
            decision,
        });
    }

    pub(crate) fn handle_data(&self, src: MacAddr, pdu: &Pdu<'_>, now: u64) {
        let key = (src, pdu.msg_id);
        let mut acknowledge = false;
        let mut recomplete = None;
        let mut completed = None;

        {
            let mut inbound = self.inbound.lock().unwrap();
            let Some(transfer) = inbound.get_mut(&key) else {
                return;
            };

            match transfer.state {
                InboundState::Receiving => {
                    match transfer.on_data(pdu.frag_index, pdu.payload, now) {
                        Ok(outcome) => {
                            // Duplicates are re-acknowledged so the
                            // sender can recover from lost ACKs.
                            acknowledge = true;
                            if !outcome.newly_stored {
                                self.counters
                                    .duplicate_fragments
                                    .fetch_add(1, Ordering::Relaxed);
                            }
                            if outcome.complete {
                                let (data, digest_ok) = transfer.assemble();
                                completed =
                                    Some((transfer.filename.clone(), data, digest_ok));
                            }
                        }
                        Err(err) => {
                            self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                            log::debug!("bad file fragment from {src}: {err}");
                        }
                    }
                }

                // The record finished but still answers late
                // duplicates whose ACKs or completion went missing.
                InboundState::Done | InboundState::Failed => {
                    if pdu.frag_index < transfer.frag_total {
                        acknowledge = true;
                        recomplete = transfer.verdict;
                        self.counters
                            .duplicate_fragments
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }

                InboundState::Pending | InboundState::Verifying => {}
            }
        }

        if acknowledge {
            self.send_ack(src, pdu.msg_id, pdu.frag_index);
        }

        if let Some(digest_ok) = recomplete {
            self.send_complete(src, pdu.msg_id, digest_ok);
        }

        if let Some((filename, data, digest_ok)) = completed {
            self.send_complete(src, pdu.msg_id, digest_ok);
            if digest_ok {
                log::info!("received {filename} from {src}: {} bytes", data.len());
            } else {
                log::warn!("digest mismatch for {filename} from {src}");
            }
            self.events.emit(Event::FileReceived {
                source: src,
                filename,
                data: Arc::new(data),
                digest_ok,
            });
        }
    }

    pub(crate) fn handle_ack(&self, src: MacAddr, pdu: &Pdu<'_>, now: u64) {
        let ack = match FileAck::decode(pdu.payload) {
            Ok(ack) => ack,
            Err(err) => {
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("bad file ack from {src}: {err}");
                return;
            }
        };

        let mut sends = Vec::new();
        let mut progress = None;
        let dest;
        let frag_total;

        {
            let mut outbound = self.outbound.lock().unwrap();
            let Some(transfer) = outbound.get_mut(&ack.msg_id) else {
                return;
            };
            if transfer.dest != src {
                return;
            }

            let indices = if ack.frag_index == OFFER_ACCEPT_FRAG {
                transfer.on_offer_accepted()
            } else {
                let result =
                    transfer.on_frag_ack(ack.frag_index, now, self.config.file_complete_timeout_ms);
                if result.newly_acked {
                    progress = Some((transfer.bytes_acked, transfer.bytes_total));
                }
                result.to_send
            };

            for index in indices {
                sends.push((index, transfer.fragments[index as usize].clone()));
                transfer.mark_frag_sent(index, now);
            }

            dest = transfer.dest;
            frag_total = transfer.frag_total();
        }

        for (index, data) in sends {
            if let Err(err) = send_pdu(
                self.link.as_ref(),
                dest,
                &Pdu::file_data(ack.msg_id, index, frag_total, &data),
            ) {
                self.report_send_failure("file fragment", dest, &err);
            }
        }

        if let Some((bytes_acked, bytes_total)) = progress {
            self.events.emit(Event::FileProgress {
                msg_id: ack.msg_id,
                bytes_acked,
                bytes_total,
            });
        }
    }

    pub(crate) fn handle_complete(&self, src: MacAddr, pdu: &Pdu<'_>) {
        let complete = match FileComplete::decode(pdu.payload) {
            Ok(complete) => complete,
            Err(err) => {
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("bad file completion from {src}: {err}");
                return;
            }
        };

        let outcome = {
            let mut outbound = self.outbound.lock().unwrap();
            let Some(transfer) = outbound.get_mut(&complete.msg_id) else {
                return;
            };
            if transfer.dest != src {
                return;
            }

            let reason = transfer.on_complete(complete.digest_ok);
            outbound.remove(&complete.msg_id);
            reason
        };

        match outcome {
            None => {
                log::info!("transfer {} confirmed by {src}", complete.msg_id);
                self.events.emit(Event::FileSendDone {
                    msg_id: complete.msg_id,
                });
            }
            Some(reason) => {
                log::warn!("transfer {} failed: {reason}", complete.msg_id);
                self.events.emit(Event::FileSendFailed {
                    msg_id: complete.msg_id,
                    reason,
                });
            }
        }
    }

    /// Runs retransmission, acceptance and stall timers.
    pub(crate) fn tick(&self, now: u64) {
        self.tick_outbound(now);
        self.tick_inbound(now);
    }

    fn tick_outbound(&self, now: u64) {
        let mut offer_resends = Vec::new();
        let mut frag_resends = Vec::new();
        let mut failures = Vec::new();

        {
            let mut outbound = self.outbound.lock().unwrap();

            for (msg_id, transfer) in outbound.iter_mut() {
                let tick = transfer.tick(now, &self.config);

                if tick.resend_offer {
                    offer_resends.push((transfer.dest, *msg_id, transfer.offer().encode()));
                    transfer.mark_offer_sent(now);
                }

                for index in tick.resend_frags {
                    frag_resends.push((
                        transfer.dest,
                        *msg_id,
                        index,
                        transfer.frag_total(),
                        transfer.fragments[index as usize].clone(),
                    ));
                    transfer.mark_frag_sent(index, now);
                }

                if let Some(reason) = tick.failed {
                    failures.push((*msg_id, reason));
                }
            }

            outbound.retain(|_, t| t.state != OutboundState::Failed);
        }

        for (dest, msg_id, offer) in offer_resends {
            log::debug!("retransmitting offer {msg_id} to {dest}");
            if let Err(err) = send_pdu(self.link.as_ref(), dest, &Pdu::file_offer(msg_id, &offer)) {
                self.report_send_failure("offer retransmit", dest, &err);
            }
        }

        for (dest, msg_id, index, total, data) in frag_resends {
            log::debug!("retransmitting fragment {index} of {msg_id} to {dest}");
            if let Err(err) = send_pdu(
                self.link.as_ref(),
                dest,
                &Pdu::file_data(msg_id, index, total, &data),
            ) {
                self.report_send_failure("fragment retransmit", dest, &err);
            }
        }

        for (msg_id, reason) in failures {
            log::warn!("transfer {msg_id} failed: {reason}");
            self.events.emit(Event::FileSendFailed { msg_id, reason });
        }
    }

    fn tick_inbound(&self, now: u64) {
        let mut accepts = Vec::new();
        let mut rejects = Vec::new();

        {
            let mut inbound = self.inbound.lock().unwrap();
            let mut dropped = Vec::new();

            for (key, transfer) in inbound.iter_mut() {
                match transfer.tick(now, self.config.file_recv_stall_timeout_ms) {
                    InboundTick::Idle => {}
                    InboundTick::Accept => {
                        transfer.accept(now);
                        accepts.push(*key);
                    }
                    InboundTick::Reject => {
                        rejects.push(*key);
                        dropped.push(*key);
                    }
                    InboundTick::Stalled => {
                        log::warn!(
                            "inbound transfer {} from {} stalled, dropping",
                            key.1,
                            key.0
                        );
                        dropped.push(*key);
                    }
                    InboundTick::Expired => {
                        dropped.push(*key);
                    }
                }
            }

            for key in dropped {
                inbound.remove(&key);
            }
        }

        for (src, msg_id) in accepts {
            log::info!("accepting transfer {msg_id} from {src}");
            self.send_ack(src, msg_id, OFFER_ACCEPT_FRAG);
        }

        for (src, msg_id) in rejects {
            log::info!("rejecting transfer {msg_id} from {src}");
            self.send_complete(src, msg_id, false);
        }
    }

    /// Fails every transfer touching a peer that is now DEAD.
    pub(crate) fn peer_lost(&self, mac: MacAddr) {
        let failed: Vec<u32> = {
            let mut outbound = self.outbound.lock().unwrap();
            let ids = outbound
                .iter()
                .filter(|(_, t)| t.dest == mac)
                .map(|(id, _)| *id)
                .collect();
            outbound.retain(|_, t| t.dest != mac);
            ids
        };

        for msg_id in failed {
            self.events.emit(Event::FileSendFailed {
                msg_id,
                reason: format!("peer {mac} is gone"),
            });
        }

        let mut inbound = self.inbound.lock().unwrap();
        let before = inbound.len();
        inbound.retain(|(src, _), _| *src != mac);
        if inbound.len() != before {
            log::info!("dropped inbound transfers from lost peer {mac}");
        }
    }

    /// Fails everything in flight. Used at shutdown.
    pub(crate) fn fail_all(&self, reason: &str) {
        let failed: Vec<u32> = {
            let mut outbound = self.outbound.lock().unwrap();
            let ids = outbound.keys().copied().collect();
            outbound.clear();
            ids
        };

        for msg_id in failed {
            self.events.emit(Event::FileSendFailed {
                msg_id,
                reason: reason.to_owned(),
            });
        }

        self.inbound.lock().unwrap().clear();
    }

    fn send_ack(&self, dest: MacAddr, msg_id: u32, frag_index: u16) {
        let body = FileAck { msg_id, frag_index }.encode();
        if let Err(err) = send_pdu(self.link.as_ref(), dest, &Pdu::file_ack(msg_id, &body)) {
            self.report_send_failure("file ack", dest, &err);
        }
    }

    fn send_complete(&self, dest: MacAddr, msg_id: u32, digest_ok: bool) {
        let body = FileComplete { msg_id, digest_ok }.encode();
        if let Err(err) = send_pdu(self.link.as_ref(), dest, &Pdu::file_complete(msg_id, &body)) {
            self.report_send_failure("file completion", dest, &err);
        }
    }

    fn report_send_failure(&self, what: &str, dest: MacAddr, err: &crate::error::Error) {
        log::warn!("{what} to {dest} failed: {err}");
        self.events.emit(Event::TransportError {
            detail: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ethernet::{EthernetFrame, MAX_FRAME_LEN};
    use crate::core::pdu::{PduType, MAX_PDU_PAYLOAD};
    use crate::event::EventKind;
    use crate::transport::TestHub;
    use sha2::Digest;
    use std::time::Duration;

    const LOCAL: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xAA]);
    const PEER: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xBB]);

    fn engine(hub: &TestHub, config: Config) -> (TransferEngine, Arc<Dispatcher>) {
        let link = Arc::new(hub.link(LOCAL));
        let events = Arc::new(Dispatcher::new(256));
        let engine = TransferEngine::new(
            link,
            Arc::clone(&events),
            config,
            MsgIdGen::new(),
            Arc::new(Counters::default()),
        );
        (engine, events)
    }

    fn recv_pdu(link: &dyn FrameTransport) -> Option<(PduType, u32, u16, Vec<u8>)> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = link.recv(&mut buf).unwrap()?;
        let frame = EthernetFrame::deserialize(&buf[..n]).unwrap();
        let pdu = Pdu::deserialize(frame.payload).unwrap();
        Some((pdu.pdu_type, pdu.msg_id, pdu.frag_index, pdu.payload.to_vec()))
    }

    #[test]
    fn test_send_data_emits_offer() {
        let hub = TestHub::new();
        let (engine, _) = engine(&hub, Config::new());
        let peer_link = hub.link(PEER);

        let msg_id = engine.send_data(PEER, "blob.bin", vec![1, 2, 3]).unwrap();

        let (pdu_type, id, _, payload) = recv_pdu(&peer_link).unwrap();
        assert_eq!(pdu_type, PduType::FileOffer);
        assert_eq!(id, msg_id);

        let offer = FileOffer::decode(&payload).unwrap();
        assert_eq!(offer.file_size, 3);
        assert_eq!(offer.frag_total, 1);
        assert_eq!(offer.filename, "blob.bin");
    }

    #[test]
    fn test_acceptance_starts_window() {
        let hub = TestHub::new();
        let (engine, _) = engine(&hub, Config::new().with_file_window(2));
        let peer_link = hub.link(PEER);

        let data = vec![9u8; MAX_PDU_PAYLOAD * 4];
        let msg_id = engine.send_data(PEER, "blob.bin", data).unwrap();
        let _ = recv_pdu(&peer_link); // offer

        let ack = FileAck {
            msg_id,
            frag_index: OFFER_ACCEPT_FRAG,
        }
        .encode();
        engine.handle_ack(PEER, &Pdu::file_ack(msg_id, &ack), 100);

        // Window of two fragments in flight.
        assert_eq!(recv_pdu(&peer_link).unwrap().2, 0);
        assert_eq!(recv_pdu(&peer_link).unwrap().2, 1);
        assert!(recv_pdu(&peer_link).is_none());

        // Acking fragment 0 releases fragment 2 and reports progress.
        let ack = FileAck {
            msg_id,
            frag_index: 0,
        }
        .encode();
        engine.handle_ack(PEER, &Pdu::file_ack(msg_id, &ack), 200);
        assert_eq!(recv_pdu(&peer_link).unwrap().2, 2);
    }

    #[test]
    fn test_inbound_acks_every_fragment() {
        let hub = TestHub::new();
        let config = Config::new();
        let accept_ms = config.file_accept_timeout_ms;
        let (engine, events) = engine(&hub, config);
        let peer_link = hub.link(PEER);

        let data = vec![5u8; 10];
        let offer = FileOffer {
            file_size: data.len() as u64,
            frag_total: 1,
            filename: "x.bin".to_owned(),
            digest: sha2::Sha256::digest(&data).into(),
        };

        engine.handle_offer(PEER, &Pdu::file_offer(7, &offer.encode()), 0);
        match events.poll(Duration::from_millis(10)).unwrap() {
            Event::FileOffer { decision, .. } => decision.accept(),
            other => panic!("unexpected event {other:?}"),
        }

        engine.tick(accept_ms);
        let (pdu_type, _, frag, _) = recv_pdu(&peer_link).unwrap();
        assert_eq!((pdu_type, frag), (PduType::FileAck, 0));

        // Data, then a duplicate of the same fragment: both acked, and
        // the duplicate re-drives the completion verdict.
        engine.handle_data(PEER, &Pdu::file_data(7, 0, 1, &data), 100);
        engine.handle_data(PEER, &Pdu::file_data(7, 0, 1, &data), 110);

        let mut acks = 0;
        let mut completes = 0;
        while let Some((pdu_type, _, _, payload)) = recv_pdu(&peer_link) {
            match pdu_type {
                PduType::FileAck => acks += 1,
                PduType::FileComplete => {
                    completes += 1;
                    assert!(FileComplete::decode(&payload).unwrap().digest_ok);
                }
                other => panic!("unexpected pdu {other:?}"),
            }
        }
        assert_eq!(acks, 2);
        assert_eq!(completes, 2);
        assert_eq!(
            engine.counters.duplicate_fragments.load(Ordering::Relaxed),
            1
        );

        match events.poll(Duration::from_millis(10)).unwrap() {
            Event::FileReceived {
                data: received,
                digest_ok,
                ..
            } => {
                assert!(digest_ok);
                assert_eq!(received.as_slice(), &data[..]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_rejection_sends_mismatch_completion() {
        let hub = TestHub::new();
        let (engine, events) = engine(&hub, Config::new());
        let peer_link = hub.link(PEER);

        let offer = FileOffer {
            file_size: 1,
            frag_total: 1,
            filename: "x".to_owned(),
            digest: [0; 32],
        };
        engine.handle_offer(PEER, &Pdu::file_offer(9, &offer.encode()), 0);

        match events.poll(Duration::from_millis(10)).unwrap() {
            Event::FileOffer { decision, .. } => decision.reject(),
            other => panic!("unexpected event {other:?}"),
        }

        engine.tick(10);
        let (pdu_type, msg_id, _, payload) = recv_pdu(&peer_link).unwrap();
        assert_eq!(pdu_type, PduType::FileComplete);
        assert_eq!(msg_id, 9);
        assert!(!FileComplete::decode(&payload).unwrap().digest_ok);

        // The record is gone: further data is ignored.
        engine.handle_data(PEER, &Pdu::file_data(9, 0, 1, &[1]), 100);
        assert!(recv_pdu(&peer_link).is_none());
    }

    #[test]
    fn test_offer_retransmit_reacks_accepted_transfer() {
        let hub = TestHub::new();
        let (engine, events) = engine(&hub, Config::new());
        let peer_link = hub.link(PEER);

        let offer = FileOffer {
            file_size: 4,
            frag_total: 1,
            filename: "x".to_owned(),
            digest: [0; 32],
        };
        engine.handle_offer(PEER, &Pdu::file_offer(3, &offer.encode()), 0);
        match events.poll(Duration::from_millis(10)).unwrap() {
            Event::FileOffer { decision, .. } => decision.accept(),
            other => panic!("unexpected event {other:?}"),
        }
        engine.tick(10);
        let _ = recv_pdu(&peer_link); // acceptance ack

        // The sender retransmits the offer (our ack was lost).
        engine.handle_offer(PEER, &Pdu::file_offer(3, &offer.encode()), 200);
        let (pdu_type, _, frag, _) = recv_pdu(&peer_link).unwrap();
        assert_eq!((pdu_type, frag), (PduType::FileAck, OFFER_ACCEPT_FRAG));

        // And no second file-offer event was raised.
        assert!(events.poll(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_peer_lost_fails_transfers() {
        let hub = TestHub::new();
        let (engine, events) = engine(&hub, Config::new());
        let _peer_link = hub.link(PEER);

        let msg_id = engine.send_data(PEER, "blob", vec![1, 2, 3]).unwrap();
        engine.peer_lost(PEER);

        match events.poll(Duration::from_millis(10)).unwrap() {
            Event::FileSendFailed { msg_id: id, .. } => assert_eq!(id, msg_id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_fail_all_on_shutdown() {
        let hub = TestHub::new();
        let (engine, events) = engine(&hub, Config::new());
        let _peer_link = hub.link(PEER);

        engine.send_data(PEER, "a", vec![1]).unwrap();
        engine.send_data(PEER, "b", vec![2]).unwrap();
        engine.fail_all("engine shutdown");

        for _ in 0..2 {
            assert_eq!(
                events.poll(Duration::from_millis(10)).unwrap().kind(),
                EventKind::FileSendFailed
            );
        }
    }
}
