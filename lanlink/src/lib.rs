//! Peer-to-peer chat and file transfer over raw Ethernet frames.
//!
//! lanlink speaks directly at layer 2: peers on one broadcast domain
//! discover each other with HELLO broadcasts, exchange text messages,
//! and transfer files with per-fragment acknowledgment and
//! retransmission. Frames carry a private EtherType (`0x88B5`) and a
//! 13-byte PDU header; anything larger than one frame is fragmented
//! and reassembled.
//!
//! The engine runs on plain OS threads and reports everything through
//! a bounded event queue: peer liveness, received messages, file
//! offers (with an accept/reject continuation), transfer progress and
//! terminal transfer states.
//!
//! # Example
//!
//! ```rust,ignore
//! use lanlink::{Config, EventKind, LinkEngine};
//!
//! let config = Config::new().with_display_name("workbench");
//! let engine = LinkEngine::open("eth0", config)?;
//!
//! engine.observe(EventKind::MessageReceived, |event| {
//!     println!("{event:?}");
//! });
//!
//! engine.broadcast_text("hello, segment")?;
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod event;
pub mod peer;
pub mod reliable;
pub mod transport;

mod discovery;
mod engine;
mod messaging;
mod transfer;

pub use crate::config::{Config, Delivery};
pub use crate::core::ethernet::{EthernetFrame, MacAddr, ETHERTYPE};
pub use crate::core::pdu::{Pdu, PduFlags, PduType};
pub use crate::engine::{EngineStats, LinkEngine};
pub use crate::error::{Error, Result};
pub use crate::event::{Event, EventKind, OfferDecision};
pub use crate::peer::{PeerRecord, PeerState};
#[cfg(target_os = "linux")]
pub use crate::transport::RawSocket;
pub use crate::transport::{FrameTransport, HubLink, TestHub};
