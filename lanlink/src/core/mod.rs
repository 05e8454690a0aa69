//! Wire formats: Ethernet II framing and the protocol PDU.

pub mod ethernet;
pub mod pdu;

pub use ethernet::{EthernetFrame, MacAddr, ETHERTYPE};
pub use pdu::{Pdu, PduFlags, PduType};
