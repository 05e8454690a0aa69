//! Protocol data unit definition and serialization.
//!
//! One PDU travels inside one Ethernet frame. Messages larger than a
//! frame are split into multiple PDUs sharing a `msg_id` and indexed by
//! `frag_index`.
//!
//! # Header Format
//!
//! ```text
//! 0        1        2        3                 7        9        11       13
//! +--------+--------+--------+-----------------+--------+--------+--------+
//! | Version| Type   | Flags  | Message ID (4)  | FragIdx| FragTot| PayLen |
//! +--------+--------+--------+-----------------+--------+--------+--------+
//! | Payload...                                                            |
//! +-----------------------------------------------------------------------+
//! ```
//!
//! All multi-byte integers are big-endian.

use super::ethernet::MAX_PAYLOAD_LEN;
use crate::error::{Error, Result};
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Protocol version carried in every PDU.
pub const PDU_VERSION: u8 = 1;

/// PDU header size in bytes.
pub const PDU_HEADER_SIZE: usize = 13;

/// Maximum application payload per PDU.
pub const MAX_PDU_PAYLOAD: usize = MAX_PAYLOAD_LEN - PDU_HEADER_SIZE;

/// Maximum display name length in HELLO payloads, in bytes.
pub const MAX_DISPLAY_NAME: usize = 64;

/// Fragment index sentinel acknowledging a FILE-OFFER.
pub const OFFER_ACCEPT_FRAG: u16 = 0xFFFF;

/// PDU type indicating the purpose of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PduType {
    /// Periodic presence broadcast, optionally carrying a display name.
    Hello = 1,

    /// Unicast reply to a HELLO.
    HelloAck = 2,

    /// UTF-8 chat message fragment.
    Text = 3,

    /// File metadata: size, fragment count, name, SHA-256 digest.
    FileOffer = 4,

    /// Raw file fragment bytes.
    FileData = 5,

    /// Acknowledgment of one file fragment (or the offer sentinel).
    FileAck = 6,

    /// Terminal digest verdict from the receiver.
    FileComplete = 7,

    /// Departure announcement.
    Goodbye = 8,
}

impl PduType {
    /// Converts a wire byte to a PduType.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Hello),
            2 => Some(Self::HelloAck),
            3 => Some(Self::Text),
            4 => Some(Self::FileOffer),
            5 => Some(Self::FileData),
            6 => Some(Self::FileAck),
            7 => Some(Self::FileComplete),
            8 => Some(Self::Goodbye),
            _ => None,
        }
    }
}

/// PDU flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PduFlags(u8);

impl PduFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Further fragments of this `msg_id` follow.
    pub const MORE_FRAGMENTS: Self = Self(1 << 0);

    /// The receiver must acknowledge this PDU.
    pub const ACK_REQUIRED: Self = Self(1 << 1);

    /// This PDU is itself an acknowledgment.
    pub const IS_ACK: Self = Self(1 << 2);

    /// Creates flags from raw bits; reserved bits are preserved.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Checks whether all bits of `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Combines two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// A protocol data unit with a borrowed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu<'a> {
    /// Message purpose.
    pub pdu_type: PduType,

    /// Control flags.
    pub flags: PduFlags,

    /// Sender-assigned identifier, shared by all fragments of one
    /// logical message.
    pub msg_id: u32,

    /// 0-based fragment index.
    pub frag_index: u16,

    /// Total fragment count for this `msg_id`, at least 1.
    pub frag_total: u16,

    /// Type-specific body.
    pub payload: &'a [u8],
}

impl<'a> Pdu<'a> {
    /// Creates an unfragmented PDU.
    fn single(pdu_type: PduType, flags: PduFlags, msg_id: u32, payload: &'a [u8]) -> Self {
        Self {
            pdu_type,
            flags,
            msg_id,
            frag_index: 0,
            frag_total: 1,
            payload,
        }
    }

    /// Creates a HELLO carrying an optional display name.
    pub fn hello(msg_id: u32, name: &'a [u8]) -> Self {
        Self::single(PduType::Hello, PduFlags::NONE, msg_id, name)
    }

    /// Creates a HELLO-ACK carrying an optional display name.
    pub fn hello_ack(msg_id: u32, name: &'a [u8]) -> Self {
        Self::single(PduType::HelloAck, PduFlags::NONE, msg_id, name)
    }

    /// Creates one TEXT fragment. Text is best-effort and never asks
    /// for acknowledgment.
    pub fn text(msg_id: u32, frag_index: u16, frag_total: u16, payload: &'a [u8]) -> Self {
        let mut flags = PduFlags::NONE;
        if frag_index + 1 < frag_total {
            flags.insert(PduFlags::MORE_FRAGMENTS);
        }
        Self {
            pdu_type: PduType::Text,
            flags,
            msg_id,
            frag_index,
            frag_total,
            payload,
        }
    }

    /// Creates a FILE-OFFER around an encoded [`FileOffer`] body.
    pub fn file_offer(msg_id: u32, payload: &'a [u8]) -> Self {
        Self::single(PduType::FileOffer, PduFlags::ACK_REQUIRED, msg_id, payload)
    }

    /// Creates one FILE-DATA fragment.
    pub fn file_data(msg_id: u32, frag_index: u16, frag_total: u16, payload: &'a [u8]) -> Self {
        let mut flags = PduFlags::ACK_REQUIRED;
        if frag_index + 1 < frag_total {
            flags.insert(PduFlags::MORE_FRAGMENTS);
        }
        Self {
            pdu_type: PduType::FileData,
            flags,
            msg_id,
            frag_index,
            frag_total,
            payload,
        }
    }

    /// Creates a FILE-ACK around an encoded [`FileAck`] body.
    pub fn file_ack(msg_id: u32, payload: &'a [u8]) -> Self {
        Self::single(PduType::FileAck, PduFlags::IS_ACK, msg_id, payload)
    }

    /// Creates a FILE-COMPLETE around an encoded [`FileComplete`] body.
    pub fn file_complete(msg_id: u32, payload: &'a [u8]) -> Self {
        Self::single(PduType::FileComplete, PduFlags::NONE, msg_id, payload)
    }

    /// Creates a GOODBYE.
    pub fn goodbye(msg_id: u32) -> Self {
        Self::single(PduType::Goodbye, PduFlags::NONE, msg_id, &[])
    }

    /// Returns the serialized size of this PDU.
    pub fn wire_size(&self) -> usize {
        PDU_HEADER_SIZE + self.payload.len()
    }

    /// Serializes the PDU into `buf`. Returns the number of bytes
    /// written.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        if self.payload.len() > MAX_PDU_PAYLOAD {
            return Err(Error::PayloadTooLarge);
        }

        let total = self.wire_size();
        if buf.len() < total {
            return Err(Error::BufferTooSmall);
        }

        buf[0] = PDU_VERSION;
        buf[1] = self.pdu_type as u8;
        buf[2] = self.flags.bits();
        buf[3..7].copy_from_slice(&self.msg_id.to_be_bytes());
        buf[7..9].copy_from_slice(&self.frag_index.to_be_bytes());
        buf[9..11].copy_from_slice(&self.frag_total.to_be_bytes());
        buf[11..13].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf[PDU_HEADER_SIZE..total].copy_from_slice(self.payload);

        Ok(total)
    }

    /// Parses a PDU from an Ethernet payload.
    ///
    /// Bytes after `payload_len` are Ethernet pad and ignored.
    pub fn deserialize(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < PDU_HEADER_SIZE {
            return Err(Error::Truncated);
        }

        if buf[0] != PDU_VERSION {
            return Err(Error::BadVersion(buf[0]));
        }

        let pdu_type = PduType::from_u8(buf[1]).ok_or(Error::BadType(buf[1]))?;
        let flags = PduFlags::from_bits(buf[2]);
        let msg_id = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
        let frag_index = u16::from_be_bytes([buf[7], buf[8]]);
        let frag_total = u16::from_be_bytes([buf[9], buf[10]]);
        let payload_len = u16::from_be_bytes([buf[11], buf[12]]) as usize;

        if buf.len() < PDU_HEADER_SIZE + payload_len {
            return Err(Error::Truncated);
        }

        Ok(Self {
            pdu_type,
            flags,
            msg_id,
            frag_index,
            frag_total,
            payload: &buf[PDU_HEADER_SIZE..PDU_HEADER_SIZE + payload_len],
        })
    }
}

/// FILE-OFFER body: the metadata a receiver needs before accepting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    /// Total file size in bytes.
    pub file_size: u64,

    /// Total fragment count of the transfer.
    pub frag_total: u32,

    /// Original file name.
    pub filename: String,

    /// SHA-256 digest of the complete file content.
    pub digest: [u8; 32],
}

impl FileOffer {
    /// Encodes the offer body.
    pub fn encode(&self) -> Vec<u8> {
        let name = self.filename.as_bytes();
        let mut out = Vec::with_capacity(14 + name.len() + 32);
        out.extend_from_slice(&self.file_size.to_be_bytes());
        out.extend_from_slice(&self.frag_total.to_be_bytes());
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.digest);
        out
    }

    /// Decodes an offer body.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 14 {
            return Err(Error::InvalidPayload);
        }

        let file_size = u64::from_be_bytes(payload[0..8].try_into().unwrap());
        let frag_total = u32::from_be_bytes(payload[8..12].try_into().unwrap());
        let name_len = u16::from_be_bytes([payload[12], payload[13]]) as usize;

        if payload.len() < 14 + name_len + 32 {
            return Err(Error::InvalidPayload);
        }

        let filename = core::str::from_utf8(&payload[14..14 + name_len])
            .map_err(|_| Error::InvalidPayload)?
            .to_owned();

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&payload[14 + name_len..14 + name_len + 32]);

        Ok(Self {
            file_size,
            frag_total,
            filename,
            digest,
        })
    }
}

/// FILE-ACK body: which fragment of which message is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAck {
    /// The `msg_id` being acknowledged.
    pub msg_id: u32,

    /// The fragment index being acknowledged, or [`OFFER_ACCEPT_FRAG`].
    pub frag_index: u16,
}

impl FileAck {
    /// Encodes the ack body.
    pub fn encode(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[0..4].copy_from_slice(&self.msg_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.frag_index.to_be_bytes());
        out
    }

    /// Decodes an ack body.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 6 {
            return Err(Error::InvalidPayload);
        }
        Ok(Self {
            msg_id: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            frag_index: u16::from_be_bytes([payload[4], payload[5]]),
        })
    }
}

/// FILE-COMPLETE body: the receiver's digest verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileComplete {
    /// The `msg_id` of the finished transfer.
    pub msg_id: u32,

    /// True when the received content hashed to the offered digest.
    pub digest_ok: bool,
}

impl FileComplete {
    /// Encodes the completion body.
    pub fn encode(&self) -> [u8; 5] {
        let mut out = [0u8; 5];
        out[0..4].copy_from_slice(&self.msg_id.to_be_bytes());
        out[4] = self.digest_ok as u8;
        out
    }

    /// Decodes a completion body.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 5 {
            return Err(Error::InvalidPayload);
        }
        Ok(Self {
            msg_id: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            digest_ok: payload[4] == 1,
        })
    }
}

/// Process-wide message id allocator.
///
/// Ids are monotonically non-decreasing for the lifetime of the
/// process; wrap-around at 2^32 is tolerated by the eviction timeouts.
#[derive(Debug, Clone)]
pub(crate) struct MsgIdGen(Arc<AtomicU32>);

impl MsgIdGen {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU32::new(1)))
    }

    pub(crate) fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_roundtrip() {
        let payload = b"hello over ethernet";
        let pdu = Pdu::text(42, 1, 3, payload);

        let mut buf = [0u8; 256];
        let size = pdu.serialize(&mut buf).unwrap();
        assert_eq!(size, PDU_HEADER_SIZE + payload.len());

        let decoded = Pdu::deserialize(&buf[..size]).unwrap();
        assert_eq!(decoded, pdu);
        assert!(decoded.flags.contains(PduFlags::MORE_FRAGMENTS));
    }

    #[test]
    fn test_last_fragment_clears_more() {
        let pdu = Pdu::text(42, 2, 3, b"tail");
        assert!(!pdu.flags.contains(PduFlags::MORE_FRAGMENTS));

        let single = Pdu::text(43, 0, 1, b"");
        assert!(!single.flags.contains(PduFlags::MORE_FRAGMENTS));
        assert_eq!(single.frag_total, 1);
    }

    #[test]
    fn test_trailing_pad_ignored() {
        let pdu = Pdu::hello(7, b"node-a");

        let mut buf = [0u8; 128];
        let size = pdu.serialize(&mut buf).unwrap();

        // Feed the parser the whole padded buffer.
        let decoded = Pdu::deserialize(&buf).unwrap();
        assert_eq!(decoded.payload, b"node-a");
        let _ = size;
    }

    #[test]
    fn test_bad_version() {
        let mut buf = [0u8; 64];
        Pdu::goodbye(1).serialize(&mut buf).unwrap();
        buf[0] = 2;

        assert!(matches!(Pdu::deserialize(&buf), Err(Error::BadVersion(2))));
    }

    #[test]
    fn test_bad_type() {
        let mut buf = [0u8; 64];
        Pdu::goodbye(1).serialize(&mut buf).unwrap();
        buf[1] = 9;

        assert!(matches!(Pdu::deserialize(&buf), Err(Error::BadType(9))));
    }

    #[test]
    fn test_truncated() {
        let mut buf = [0u8; 64];
        let size = Pdu::hello(1, b"name").serialize(&mut buf).unwrap();

        assert!(matches!(
            Pdu::deserialize(&buf[..size - 1]),
            Err(Error::Truncated)
        ));
        assert!(matches!(
            Pdu::deserialize(&buf[..PDU_HEADER_SIZE - 1]),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn test_file_offer_roundtrip() {
        let offer = FileOffer {
            file_size: 123_456,
            frag_total: 84,
            filename: "report.pdf".to_owned(),
            digest: [0xAB; 32],
        };

        let encoded = offer.encode();
        let decoded = FileOffer::decode(&encoded).unwrap();
        assert_eq!(decoded, offer);
    }

    #[test]
    fn test_file_offer_short_rejected() {
        assert!(matches!(
            FileOffer::decode(&[0u8; 13]),
            Err(Error::InvalidPayload)
        ));

        // Name length pointing past the digest.
        let offer = FileOffer {
            file_size: 1,
            frag_total: 1,
            filename: "x".to_owned(),
            digest: [0; 32],
        };
        let mut encoded = offer.encode();
        encoded[13] = 200;
        assert!(matches!(
            FileOffer::decode(&encoded),
            Err(Error::InvalidPayload)
        ));
    }

    #[test]
    fn test_file_ack_roundtrip() {
        let ack = FileAck {
            msg_id: 9,
            frag_index: OFFER_ACCEPT_FRAG,
        };
        assert_eq!(FileAck::decode(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn test_file_complete_roundtrip() {
        for ok in [true, false] {
            let complete = FileComplete {
                msg_id: 3,
                digest_ok: ok,
            };
            assert_eq!(FileComplete::decode(&complete.encode()).unwrap(), complete);
        }
    }

    #[test]
    fn test_msg_id_monotonic() {
        let ids = MsgIdGen::new();
        let a = ids.next();
        let b = ids.next();
        assert!(b > a);
    }
}
