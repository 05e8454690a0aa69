//! Fragment reassembly for out-of-order message reconstruction.
//!
//! Slots are keyed by `(source_mac, msg_id)` so concurrent messages
//! from several peers reassemble independently. Duplicate fragments
//! are detected by the received bitset and ignored; slots that fail to
//! complete are evicted by a periodic sweep.

use crate::core::ethernet::MacAddr;
use crate::core::pdu::{Pdu, PduType};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// One in-progress multi-fragment message.
#[derive(Debug)]
struct ReassemblySlot {
    /// PDU type shared by every fragment of this message.
    pdu_type: PduType,

    /// Total fragment count announced by the first-seen fragment.
    frag_total: u16,

    /// Fragment payloads, indexed by `frag_index`.
    fragments: Vec<Option<Vec<u8>>>,

    /// Number of distinct fragments received.
    received: usize,

    /// Timestamp of the first fragment, for eviction.
    first_seen: u64,
}

impl ReassemblySlot {
    fn new(pdu_type: PduType, frag_total: u16, now: u64) -> Self {
        Self {
            pdu_type,
            frag_total,
            fragments: vec![None; frag_total as usize],
            received: 0,
            first_seen: now,
        }
    }

    /// Stores a fragment. Returns true when the slot became complete;
    /// duplicates are a no-op.
    fn add_fragment(&mut self, frag_index: u16, payload: &[u8]) -> bool {
        let slot = &mut self.fragments[frag_index as usize];
        if slot.is_none() {
            *slot = Some(payload.to_vec());
            self.received += 1;
        }
        self.received == self.frag_total as usize
    }

    /// Concatenates the fragments in index order.
    fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::new();
        for fragment in self.fragments {
            out.extend_from_slice(&fragment.unwrap_or_default());
        }
        out
    }
}

/// Reassembly table for all in-flight inbound messages.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    slots: HashMap<(MacAddr, u32), ReassemblySlot>,
}

impl ReassemblyTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment into the table.
    ///
    /// Returns `Ok(Some(bytes))` when the fragment completed its
    /// message. A fragment violating the slot's invariants drops the
    /// whole slot and reports the violation.
    pub fn accept(&mut self, src: MacAddr, pdu: &Pdu<'_>, now: u64) -> Result<Option<Vec<u8>>> {
        if pdu.frag_total == 0 || pdu.frag_index >= pdu.frag_total {
            return Err(Error::InvalidFragmentIndex);
        }

        // Unfragmented messages bypass the table.
        if pdu.frag_total == 1 {
            return Ok(Some(pdu.payload.to_vec()));
        }

        let key = (src, pdu.msg_id);

        let slot = self
            .slots
            .entry(key)
            .or_insert_with(|| ReassemblySlot::new(pdu.pdu_type, pdu.frag_total, now));

        if slot.frag_total != pdu.frag_total || slot.pdu_type != pdu.pdu_type {
            self.slots.remove(&key);
            return Err(Error::FragmentMismatch);
        }

        if slot.add_fragment(pdu.frag_index, pdu.payload) {
            if let Some(slot) = self.slots.remove(&key) {
                return Ok(Some(slot.into_bytes()));
            }
        }

        Ok(None)
    }

    /// Evicts slots older than `timeout_ms`. Returns the eviction
    /// count.
    pub fn sweep(&mut self, now: u64, timeout_ms: u64) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now.saturating_sub(slot.first_seen) < timeout_ms);
        before - self.slots.len()
    }

    /// Returns the number of in-flight slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true when no reassembly is in flight.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
