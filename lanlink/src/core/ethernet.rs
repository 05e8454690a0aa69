//! Ethernet II framing.
//!
//! Frames carry the protocol PDU as their payload, tagged with the
//! private EtherType. The 4-byte FCS is owned by the NIC and never
//! appears in these buffers.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+-----------+-------------+---------+
//! | Dest MAC (6)   | Src MAC (6)    | Type (2)  | Payload     | Pad     |
//! +----------------+----------------+-----------+-------------+---------+
//! ```
//!
//! Encoded frames are zero-padded up to the 60-byte Ethernet minimum.
//! Pad bytes are indistinguishable from payload at this layer; the PDU
//! header's `payload_len` is the authoritative length above it.

use crate::error::{Error, Result};
use core::fmt;

/// The private EtherType carried by every protocol frame.
///
/// `0x88B5` is reserved by IEEE for experimental use on local networks.
pub const ETHERTYPE: u16 = 0x88B5;

/// Ethernet header length: two addresses plus the EtherType.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Minimum frame length on the wire, before FCS.
pub const MIN_FRAME_LEN: usize = 60;

/// Maximum Ethernet payload length (the MTU).
pub const MAX_PAYLOAD_LEN: usize = 1500;

/// Maximum frame length: header plus MTU.
pub const MAX_FRAME_LEN: usize = ETHERNET_HEADER_LEN + MAX_PAYLOAD_LEN;

/// A six-octet Ethernet II address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    /// Constructs an address from a six-octet slice.
    ///
    /// # Panics
    /// Panics if `data` is not six octets long.
    pub fn from_bytes(data: &[u8]) -> MacAddr {
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(data);
        MacAddr(bytes)
    }

    /// Returns the address as a sequence of octets.
    pub const fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true for the all-ones broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// An Ethernet II frame with a borrowed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame<'a> {
    /// Destination address, unicast or broadcast.
    pub dst: MacAddr,

    /// Source address.
    pub src: MacAddr,

    /// EtherType of the payload.
    pub ethertype: u16,

    /// Frame payload, pad included on the receive path.
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    /// Creates a protocol frame carrying the private EtherType.
    pub fn new(dst: MacAddr, src: MacAddr, payload: &'a [u8]) -> Self {
        Self {
            dst,
            src,
            ethertype: ETHERTYPE,
            payload,
        }
    }

    /// Returns the serialized size of this frame, pad included.
    pub fn wire_len(&self) -> usize {
        (ETHERNET_HEADER_LEN + self.payload.len()).max(MIN_FRAME_LEN)
    }

    /// Serializes the frame into `buf`, zero-padding to the minimum
    /// frame size. Returns the number of bytes written.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge);
        }

        let total = self.wire_len();
        if buf.len() < total {
            return Err(Error::BufferTooSmall);
        }

        buf[0..6].copy_from_slice(self.dst.as_bytes());
        buf[6..12].copy_from_slice(self.src.as_bytes());
        buf[12..14].copy_from_slice(&self.ethertype.to_be_bytes());

        let end = ETHERNET_HEADER_LEN + self.payload.len();
        buf[ETHERNET_HEADER_LEN..end].copy_from_slice(self.payload);
        buf[end..total].fill(0);

        Ok(total)
    }

    /// Parses a frame from raw wire bytes.
    ///
    /// Everything after the header is payload; trailing pad is left for
    /// the next layer to bound via its own length field.
    pub fn deserialize(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < ETHERNET_HEADER_LEN {
            return Err(Error::MalformedFrame);
        }

        Ok(Self {
            dst: MacAddr::from_bytes(&buf[0..6]),
            src: MacAddr::from_bytes(&buf[6..12]),
            ethertype: u16::from_be_bytes([buf[12], buf[13]]),
            payload: &buf[ETHERNET_HEADER_LEN..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let payload = [0xAAu8; 100];
        let frame = EthernetFrame::new(
            MacAddr([1, 2, 3, 4, 5, 6]),
            MacAddr([7, 8, 9, 10, 11, 12]),
            &payload,
        );

        let mut buf = [0u8; MAX_FRAME_LEN];
        let size = frame.serialize(&mut buf).unwrap();
        assert_eq!(size, ETHERNET_HEADER_LEN + 100);

        let decoded = EthernetFrame::deserialize(&buf[..size]).unwrap();
        assert_eq!(decoded.dst, frame.dst);
        assert_eq!(decoded.src, frame.src);
        assert_eq!(decoded.ethertype, ETHERTYPE);
        assert_eq!(decoded.payload, &payload[..]);
    }

    #[test]
    fn test_pad_to_minimum() {
        let frame = EthernetFrame::new(MacAddr::BROADCAST, MacAddr([1; 6]), b"hi");

        let mut buf = [0u8; MAX_FRAME_LEN];
        let size = frame.serialize(&mut buf).unwrap();
        assert_eq!(size, MIN_FRAME_LEN);

        // Pad bytes are zeroed.
        assert!(buf[16..60].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_short_frame_rejected() {
        let result = EthernetFrame::deserialize(&[0u8; 13]);
        assert!(matches!(result, Err(Error::MalformedFrame)));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = [0u8; MAX_PAYLOAD_LEN + 1];
        let frame = EthernetFrame::new(MacAddr::BROADCAST, MacAddr([1; 6]), &payload);

        let mut buf = [0u8; 2048];
        assert!(matches!(
            frame.serialize(&mut buf),
            Err(Error::PayloadTooLarge)
        ));
    }

    #[test]
    fn test_broadcast() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(!MacAddr([1, 2, 3, 4, 5, 6]).is_broadcast());
        assert_eq!(MacAddr::BROADCAST.to_string(), "ff:ff:ff:ff:ff:ff");
    }
}
