//! Text messaging: outbound fragmentation and inbound reassembly.
//!
//! Text is best-effort; no fragment is acknowledged or retransmitted.

use crate::core::ethernet::MacAddr;
use crate::core::pdu::{MsgIdGen, Pdu, MAX_PDU_PAYLOAD};
use crate::engine::Counters;
use crate::error::{Error, Result};
use crate::event::{Dispatcher, Event};
use crate::reliable::ReassemblyTable;
use crate::transport::{send_pdu, FrameTransport};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

pub(crate) struct MessagingEngine {
    link: Arc<dyn FrameTransport>,
    events: Arc<Dispatcher>,
    reassembly: Mutex<ReassemblyTable>,
    msg_ids: MsgIdGen,
    counters: Arc<Counters>,
    reassembly_timeout_ms: u64,
}

impl MessagingEngine {
    pub(crate) fn new(
        link: Arc<dyn FrameTransport>,
        events: Arc<Dispatcher>,
        msg_ids: MsgIdGen,
        counters: Arc<Counters>,
        reassembly_timeout_ms: u64,
    ) -> Self {
        Self {
            link,
            events,
            reassembly: Mutex::new(ReassemblyTable::new()),
            msg_ids,
            counters,
            reassembly_timeout_ms,
        }
    }

    /// Sends `text` to `dest`, fragmenting as needed. Returns the
    /// assigned message id.
    pub(crate) fn send_text(&self, dest: MacAddr, text: &str) -> Result<u32> {
        let bytes = text.as_bytes();
        let total = if bytes.is_empty() {
            1
        } else {
            bytes.len().div_ceil(MAX_PDU_PAYLOAD)
        };
        if total > u16::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }

        let msg_id = self.msg_ids.next();

        if bytes.is_empty() {
            send_pdu(self.link.as_ref(), dest, &Pdu::text(msg_id, 0, 1, &[]))?;
        } else {
            for (i, chunk) in bytes.chunks(MAX_PDU_PAYLOAD).enumerate() {
                let pdu = Pdu::text(msg_id, i as u16, total as u16, chunk);
                send_pdu(self.link.as_ref(), dest, &pdu)?;
            }
        }

        log::debug!("text {msg_id} to {dest}: {} bytes in {total} fragments", bytes.len());
        Ok(msg_id)
    }

    pub(crate) fn handle_text(&self, src: MacAddr, pdu: &Pdu<'_>, now: u64) {
        let completed = self.reassembly.lock().unwrap().accept(src, pdu, now);

        match completed {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => {
                    self.events.emit(Event::MessageReceived {
                        source: src,
                        text,
                        timestamp: now,
                    });
                }
                Err(_) => {
                    self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    log::debug!("discarding non-UTF-8 text {} from {src}", pdu.msg_id);
                }
            },
            Ok(None) => {}
            Err(err) => {
                self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("bad text fragment from {src}: {err}");
            }
        }
    }

    /// Evicts reassembly slots that outlived the timeout.
    pub(crate) fn sweep(&self, now: u64) {
        let evicted = self
            .reassembly
            .lock()
            .unwrap()
            .sweep(now, self.reassembly_timeout_ms);

        if evicted > 0 {
            self.counters
                .reassembly_expired
                .fetch_add(evicted as u64, Ordering::Relaxed);
            log::debug!("evicted {evicted} stale reassembly slots");
        }
    }
}
