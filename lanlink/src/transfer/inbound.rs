//! Receiver side of a file transfer.
//!
//! Lifecycle: PENDING until the embedder (or the accept timeout)
//! decides, RECEIVING while fragments arrive, VERIFYING once the
//! bitset fills, then DONE or FAILED on the digest comparison.

use crate::core::ethernet::MacAddr;
use crate::core::pdu::FileOffer;
use crate::error::{Error, Result};
use crate::event::OfferDecision;
use sha2::{Digest, Sha256};

/// Receiver transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundState {
    /// Offer received, decision outstanding.
    Pending,

    /// Accepted; fragments are being collected.
    Receiving,

    /// All fragments held; digest being checked.
    Verifying,

    /// Content matched the offered digest.
    Done,

    /// Terminal failure.
    Failed,
}

/// Outcome of storing one data fragment.
#[derive(Debug)]
pub(crate) struct DataOutcome {
    /// False for a duplicate of an already-held fragment.
    pub newly_stored: bool,

    /// True when this fragment filled the bitset.
    pub complete: bool,
}

/// Decision produced by one scheduler tick.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InboundTick {
    /// Nothing to do.
    Idle,

    /// The offer was accepted (by the observer or the timeout).
    Accept,

    /// The offer was rejected; the record should be dropped.
    Reject,

    /// No progress within the stall window; the record should be
    /// dropped.
    Stalled,

    /// A finished record has outlived its usefulness as a duplicate
    /// filter; the record should be dropped.
    Expired,
}

/// One inbound transfer record.
#[derive(Debug)]
pub(crate) struct InboundTransfer {
    pub msg_id: u32,
    pub source: MacAddr,
    pub filename: String,
    pub file_size: u64,
    pub expected_digest: [u8; 32],
    pub frag_total: u16,
    pub state: InboundState,
    pub decision: OfferDecision,

    /// Digest verdict, once verification ran.
    pub verdict: Option<bool>,

    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    accept_deadline: u64,
    last_progress: u64,
}

impl InboundTransfer {
    /// Builds a record from a decoded offer.
    pub(crate) fn new(
        msg_id: u32,
        source: MacAddr,
        offer: &FileOffer,
        decision: OfferDecision,
        now: u64,
        accept_timeout_ms: u64,
    ) -> Result<Self> {
        // frag_index is two bytes on the wire; a wider offer cannot be
        // addressed.
        if offer.frag_total == 0 || offer.frag_total > u16::MAX as u32 {
            return Err(Error::InvalidPayload);
        }

        Ok(Self {
            msg_id,
            source,
            filename: offer.filename.clone(),
            file_size: offer.file_size,
            expected_digest: offer.digest,
            frag_total: offer.frag_total as u16,
            state: InboundState::Pending,
            decision,
            verdict: None,
            fragments: vec![None; offer.frag_total as usize],
            received: 0,
            accept_deadline: now + accept_timeout_ms,
            last_progress: now,
        })
    }

    /// Moves the record into RECEIVING.
    pub(crate) fn accept(&mut self, now: u64) {
        self.state = InboundState::Receiving;
        self.last_progress = now;
    }

    /// Stores one fragment.
    pub(crate) fn on_data(&mut self, index: u16, payload: &[u8], now: u64) -> Result<DataOutcome> {
        if index >= self.frag_total {
            return Err(Error::InvalidFragmentIndex);
        }

        let slot = &mut self.fragments[index as usize];
        let newly_stored = slot.is_none();
        if newly_stored {
            *slot = Some(payload.to_vec());
            self.received += 1;
            self.last_progress = now;
        }

        Ok(DataOutcome {
            newly_stored,
            complete: self.received == self.frag_total as usize,
        })
    }

    /// Concatenates the fragments and compares the digest. Transitions
    /// to DONE or FAILED and returns the content with the verdict.
    ///
    /// The fragment storage is drained: the record stays behind only
    /// as a tombstone that keeps re-acknowledging late duplicates.
    pub(crate) fn assemble(&mut self) -> (Vec<u8>, bool) {
        self.state = InboundState::Verifying;

        let mut data = Vec::with_capacity(self.file_size as usize);
        for fragment in &mut self.fragments {
            if let Some(fragment) = fragment.take() {
                data.extend_from_slice(&fragment);
            }
        }

        let digest: [u8; 32] = Sha256::digest(&data).into();
        let digest_ok = digest == self.expected_digest;

        self.verdict = Some(digest_ok);
        self.state = if digest_ok {
            InboundState::Done
        } else {
            InboundState::Failed
        };
        (data, digest_ok)
    }

    /// Applies the accept timeout and the stall timer.
    pub(crate) fn tick(&mut self, now: u64, stall_timeout_ms: u64) -> InboundTick {
        match self.state {
            InboundState::Pending => match self.decision.get() {
                Some(true) => InboundTick::Accept,
                Some(false) => InboundTick::Reject,
                None if now >= self.accept_deadline => InboundTick::Accept,
                None => InboundTick::Idle,
            },

            InboundState::Receiving => {
                if now.saturating_sub(self.last_progress) >= stall_timeout_ms {
                    self.state = InboundState::Failed;
                    InboundTick::Stalled
                } else {
                    InboundTick::Idle
                }
            }

            InboundState::Done | InboundState::Failed => {
                if now.saturating_sub(self.last_progress) >= stall_timeout_ms {
                    InboundTick::Expired
                } else {
                    InboundTick::Idle
                }
            }

            InboundState::Verifying => InboundTick::Idle,
        }
    }
}
