//! Sender side of a file transfer.
//!
//! Lifecycle: OFFERING until the acceptance sentinel arrives, SENDING
//! under the fragment window, AWAITING_COMPLETE once every fragment is
//! acknowledged, then DONE or FAILED on the receiver's digest verdict.

use crate::config::Config;
use crate::core::ethernet::MacAddr;
use crate::core::pdu::{FileOffer, MAX_PDU_PAYLOAD};
use crate::error::{Error, Result};
use crate::reliable::SendWindow;
use sha2::{Digest, Sha256};

/// Sender transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboundState {
    /// FILE-OFFER sent, waiting for the acceptance sentinel.
    Offering,

    /// Streaming fragments under the send window.
    Sending,

    /// Every fragment acknowledged; waiting for FILE-COMPLETE.
    AwaitingComplete,

    /// Receiver confirmed a clean digest.
    Done,

    /// Terminal failure.
    Failed,
}

/// Result of acknowledging one fragment.
#[derive(Debug, Default)]
pub(crate) struct AckResult {
    /// True when this was the first ACK for the fragment.
    pub newly_acked: bool,

    /// Fragments to transmit now that the window advanced.
    pub to_send: Vec<u16>,
}

/// Work produced by one scheduler tick.
#[derive(Debug, Default)]
pub(crate) struct OutboundTick {
    /// The FILE-OFFER should be retransmitted.
    pub resend_offer: bool,

    /// Fragments whose retransmit interval elapsed.
    pub resend_frags: Vec<u16>,

    /// Terminal failure reason, if the tick failed the transfer.
    pub failed: Option<String>,
}

/// One outbound transfer record.
#[derive(Debug)]
pub(crate) struct OutboundTransfer {
    pub msg_id: u32,
    pub dest: MacAddr,
    pub filename: String,
    pub fragments: Vec<Vec<u8>>,
    pub digest: [u8; 32],
    pub bytes_total: u64,
    pub bytes_acked: u64,
    pub state: OutboundState,
    window: SendWindow,
    offer_retransmits: u8,
    offer_last_sent: u64,
    complete_deadline: u64,
}

impl OutboundTransfer {
    /// Builds a transfer record: digest over the full content, then
    /// fragmentation. An empty file becomes one empty fragment.
    pub(crate) fn new(
        msg_id: u32,
        dest: MacAddr,
        filename: &str,
        data: Vec<u8>,
        window: usize,
        now: u64,
    ) -> Result<Self> {
        let digest: [u8; 32] = Sha256::digest(&data).into();
        let bytes_total = data.len() as u64;

        let fragments: Vec<Vec<u8>> = if data.is_empty() {
            vec![Vec::new()]
        } else {
            data.chunks(MAX_PDU_PAYLOAD).map(<[u8]>::to_vec).collect()
        };

        // frag_index is two bytes on the wire.
        if fragments.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }

        let total = fragments.len() as u16;
        Ok(Self {
            msg_id,
            dest,
            filename: filename.to_owned(),
            fragments,
            digest,
            bytes_total,
            bytes_acked: 0,
            state: OutboundState::Offering,
            window: SendWindow::new(total, window),
            offer_retransmits: 0,
            offer_last_sent: now,
            complete_deadline: 0,
        })
    }

    pub(crate) fn frag_total(&self) -> u16 {
        self.fragments.len() as u16
    }

    /// The offer body announced to the receiver.
    pub(crate) fn offer(&self) -> FileOffer {
        FileOffer {
            file_size: self.bytes_total,
            frag_total: self.fragments.len() as u32,
            filename: self.filename.clone(),
            digest: self.digest,
        }
    }

    pub(crate) fn mark_offer_sent(&mut self, now: u64) {
        self.offer_last_sent = now;
        self.offer_retransmits += 1;
    }

    pub(crate) fn mark_frag_sent(&mut self, index: u16, now: u64) {
        self.window.mark_sent(index, now);
    }

    /// The acceptance sentinel arrived: start streaming. Returns the
    /// initial window of fragments to transmit.
    pub(crate) fn on_offer_accepted(&mut self) -> Vec<u16> {
        if self.state != OutboundState::Offering {
            return Vec::new();
        }
        self.state = OutboundState::Sending;
        self.window.sendable()
    }

    /// Processes a fragment ACK.
    pub(crate) fn on_frag_ack(&mut self, index: u16, now: u64, complete_timeout_ms: u64) -> AckResult {
        if self.state != OutboundState::Sending {
            return AckResult::default();
        }

        if !self.window.ack(index) {
            return AckResult::default();
        }

        self.bytes_acked += self
            .fragments
            .get(index as usize)
            .map(|f| f.len() as u64)
            .unwrap_or(0);

        if self.window.is_complete() {
            self.state = OutboundState::AwaitingComplete;
            self.complete_deadline = now + complete_timeout_ms;
        }

        AckResult {
            newly_acked: true,
            to_send: self.window.sendable(),
        }
    }

    /// Processes the receiver's FILE-COMPLETE verdict. Returns the
    /// terminal failure reason, or `None` when the transfer is DONE.
    pub(crate) fn on_complete(&mut self, digest_ok: bool) -> Option<String> {
        let reason = if digest_ok {
            None
        } else if self.state == OutboundState::Offering {
            Some("offer rejected by receiver".to_owned())
        } else {
            Some("digest mismatch at receiver".to_owned())
        };

        self.state = match reason {
            None => OutboundState::Done,
            Some(_) => OutboundState::Failed,
        };
        reason
    }

    /// Runs the retransmission timers.
    pub(crate) fn tick(&mut self, now: u64, config: &Config) -> OutboundTick {
        let mut tick = OutboundTick::default();

        match self.state {
            OutboundState::Offering => {
                if now.saturating_sub(self.offer_last_sent) >= config.file_offer_retry_interval_ms {
                    if self.offer_retransmits >= config.file_offer_max_retries {
                        tick.failed = Some("no answer to file offer".to_owned());
                    } else {
                        tick.resend_offer = true;
                    }
                }
            }

            OutboundState::Sending => {
                let mut failed = None;
                self.window.check_timeouts(
                    now,
                    config.file_frag_retry_interval_ms,
                    config.file_frag_max_retries,
                    |index, exceeded| {
                        if exceeded {
                            failed.get_or_insert(index);
                        } else {
                            tick.resend_frags.push(index);
                        }
                    },
                );

                if let Some(index) = failed {
                    tick.resend_frags.clear();
                    tick.failed = Some(format!("fragment {index} exceeded retry limit"));
                }
            }

            OutboundState::AwaitingComplete => {
                if now >= self.complete_deadline {
                    tick.failed = Some("timed out waiting for completion".to_owned());
                }
            }

            OutboundState::Done | OutboundState::Failed => {}
        }

        if tick.failed.is_some() {
            self.state = OutboundState::Failed;
        }
        tick
    }
}
