//! Frame transport abstraction.
//!
//! The engines speak [`FrameTransport`]: synchronous `send`, blocking
//! `recv` run on a dedicated receive thread, and nothing else. The
//! production implementation is the AF_PACKET [`RawSocket`]; the
//! in-memory [`TestHub`] wires several engines into one broadcast
//! domain for tests and embedders that want a simulated segment.

use crate::core::ethernet::{EthernetFrame, MacAddr, MAX_FRAME_LEN};
use crate::core::pdu::Pdu;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(target_os = "linux")]
pub mod raw_socket;

#[cfg(target_os = "linux")]
pub use raw_socket::RawSocket;

/// A link capable of moving whole Ethernet frames.
///
/// Implementations do not buffer or retry; retry policy belongs to the
/// engines above. `send` must be callable from any thread; outbound
/// writes are serialized internally.
pub trait FrameTransport: Send + Sync {
    /// Sends one serialized Ethernet frame. Synchronous.
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Waits for the next frame and copies it into `buf`, returning its
    /// length. Returns `Ok(None)` when the receive interval elapsed
    /// without traffic, so the caller can observe its stop flag.
    fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// The address of the local interface.
    fn local_mac(&self) -> MacAddr;
}

/// Serializes `pdu` into an Ethernet frame for `dst` and sends it.
pub(crate) fn send_pdu(link: &dyn FrameTransport, dst: MacAddr, pdu: &Pdu<'_>) -> Result<()> {
    let mut pdu_buf = [0u8; MAX_FRAME_LEN];
    let n = pdu.serialize(&mut pdu_buf)?;

    let frame = EthernetFrame::new(dst, link.local_mac(), &pdu_buf[..n]);
    let mut frame_buf = [0u8; MAX_FRAME_LEN];
    let len = frame.serialize(&mut frame_buf)?;

    link.send(&frame_buf[..len])
}

/// Outbound frame inspector for [`HubLink`].
///
/// May mutate the frame in place; returning false drops it.
pub type FrameTap = Box<dyn FnMut(&mut Vec<u8>) -> bool + Send>;

struct HubState {
    links: Mutex<HashMap<MacAddr, mpsc::Sender<Vec<u8>>>>,
}

/// An in-memory broadcast domain.
///
/// Every [`HubLink`] attached to the hub sees unicast frames addressed
/// to it and every broadcast frame sent by the others, mirroring a
/// single Ethernet segment.
pub struct TestHub {
    state: Arc<HubState>,
}

impl TestHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self {
            state: Arc::new(HubState {
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attaches a new link with the given address.
    pub fn link(&self, mac: MacAddr) -> HubLink {
        let (tx, rx) = mpsc::channel();
        self.state.links.lock().unwrap().insert(mac, tx);

        HubLink {
            mac,
            rx: Mutex::new(rx),
            state: Arc::clone(&self.state),
            tap: Mutex::new(None),
        }
    }
}

impl Default for TestHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One port on a [`TestHub`].
pub struct HubLink {
    mac: MacAddr,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    state: Arc<HubState>,
    tap: Mutex<Option<FrameTap>>,
}

impl HubLink {
    /// Installs an outbound tap for loss and corruption scenarios.
    pub fn set_tap(&self, tap: impl FnMut(&mut Vec<u8>) -> bool + Send + 'static) {
        *self.tap.lock().unwrap() = Some(Box::new(tap));
    }

    /// Removes the outbound tap.
    pub fn clear_tap(&self) {
        *self.tap.lock().unwrap() = None;
    }
}

impl FrameTransport for HubLink {
    fn send(&self, frame: &[u8]) -> Result<()> {
        if frame.len() < 14 {
            return Err(Error::MalformedFrame);
        }

        let mut owned = frame.to_vec();
        if let Some(tap) = self.tap.lock().unwrap().as_mut() {
            if !tap(&mut owned) {
                return Ok(());
            }
        }

        let dst = MacAddr::from_bytes(&owned[0..6]);
        let links = self.state.links.lock().unwrap();

        if dst.is_broadcast() {
            for (mac, tx) in links.iter() {
                if *mac != self.mac {
                    let _ = tx.send(owned.clone());
                }
            }
        } else if let Some(tx) = links.get(&dst) {
            let _ = tx.send(owned);
        }

        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(Duration::from_millis(20)) {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(Some(n))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::RecvFailed("hub disconnected".to_owned()))
            }
        }
    }

    fn local_mac(&self) -> MacAddr {
        self.mac
    }
}

impl Drop for HubLink {
    fn drop(&mut self) {
        self.state.links.lock().unwrap().remove(&self.mac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ethernet::EthernetFrame;

    fn frame_to(dst: MacAddr, src: MacAddr) -> Vec<u8> {
        let frame = EthernetFrame::new(dst, src, b"payload");
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = frame.serialize(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn test_unicast_delivery() {
        let hub = TestHub::new();
        let a = hub.link(MacAddr([1; 6]));
        let b = hub.link(MacAddr([2; 6]));
        let c = hub.link(MacAddr([3; 6]));

        a.send(&frame_to(MacAddr([2; 6]), MacAddr([1; 6]))).unwrap();

        let mut buf = [0u8; MAX_FRAME_LEN];
        assert!(b.recv(&mut buf).unwrap().is_some());
        assert!(c.recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let hub = TestHub::new();
        let a = hub.link(MacAddr([1; 6]));
        let b = hub.link(MacAddr([2; 6]));

        a.send(&frame_to(MacAddr::BROADCAST, MacAddr([1; 6])))
            .unwrap();

        let mut buf = [0u8; MAX_FRAME_LEN];
        assert!(b.recv(&mut buf).unwrap().is_some());
        assert!(a.recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_tap_drops_frames() {
        let hub = TestHub::new();
        let a = hub.link(MacAddr([1; 6]));
        let b = hub.link(MacAddr([2; 6]));

        a.set_tap(|_| false);
        a.send(&frame_to(MacAddr([2; 6]), MacAddr([1; 6]))).unwrap();

        let mut buf = [0u8; MAX_FRAME_LEN];
        assert!(b.recv(&mut buf).unwrap().is_none());

        a.clear_tap();
        a.send(&frame_to(MacAddr([2; 6]), MacAddr([1; 6]))).unwrap();
        assert!(b.recv(&mut buf).unwrap().is_some());
    }
}
