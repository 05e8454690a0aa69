//! AF_PACKET transport bound to one interface and the private
//! EtherType.
//!
//! Binding the socket to the EtherType means the kernel only delivers
//! matching frames; no userspace BPF filter is needed. Opening the
//! socket requires CAP_NET_RAW.

use super::FrameTransport;
use crate::core::ethernet::{MacAddr, ETHERTYPE};
use crate::error::{Error, Result};
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

/// Receive timeout, so the receive thread can observe the stop flag.
const RECV_TIMEOUT_MS: u64 = 200;

/// A raw link-layer socket on a named interface.
pub struct RawSocket {
    fd: OwnedFd,
    mac: MacAddr,
    send_lock: Mutex<()>,
}

impl RawSocket {
    /// Opens a raw socket on `interface`, bound to the protocol
    /// EtherType, and discovers the interface's hardware address.
    pub fn open(interface: &str) -> Result<Self> {
        let proto = (ETHERTYPE).to_be() as libc::c_int;

        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, proto) };
        if fd < 0 {
            return Err(classify_open_error(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let name = CString::new(interface).map_err(|_| not_found(interface))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(not_found(interface));
        }

        let mac = interface_mac(fd.as_raw_fd(), interface)?;
        bind_to_interface(fd.as_raw_fd(), ifindex as libc::c_int)?;
        set_recv_timeout(fd.as_raw_fd(), RECV_TIMEOUT_MS)?;

        log::info!("raw socket open on {interface} ({mac})");

        Ok(Self {
            fd,
            mac,
            send_lock: Mutex::new(()),
        })
    }
}

impl FrameTransport for RawSocket {
    fn send(&self, frame: &[u8]) -> Result<()> {
        let _guard = self.send_lock.lock().unwrap();

        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };

        if n < 0 {
            Err(Error::SendFailed(io::Error::last_os_error().to_string()))
        } else {
            Ok(())
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(None),
                _ => Err(Error::RecvFailed(err.to_string())),
            }
        } else {
            Ok(Some(n as usize))
        }
    }

    fn local_mac(&self) -> MacAddr {
        self.mac
    }
}

fn not_found(interface: &str) -> Error {
    Error::InterfaceNotFound(interface.to_owned())
}

fn classify_open_error(err: io::Error) -> Error {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => Error::PermissionDenied,
        _ => Error::Io(err),
    }
}

fn ifreq_for(interface: &str) -> Result<libc::ifreq> {
    let bytes = interface.as_bytes();
    if bytes.len() >= libc::IF_NAMESIZE {
        return Err(not_found(interface));
    }

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(req)
}

/// Reads the hardware address via SIOCGIFHWADDR.
fn interface_mac(fd: RawFd, interface: &str) -> Result<MacAddr> {
    let mut req = ifreq_for(interface)?;

    let res = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) };
    if res < 0 {
        return Err(not_found(interface));
    }

    let sa_data = unsafe { req.ifr_ifru.ifru_hwaddr.sa_data };
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(&sa_data[..6]) {
        *dst = *src as u8;
    }
    Ok(MacAddr(mac))
}

fn bind_to_interface(fd: RawFd, ifindex: libc::c_int) -> Result<()> {
    let sockaddr = libc::sockaddr_ll {
        sll_family: libc::AF_PACKET as u16,
        sll_protocol: (ETHERTYPE).to_be(),
        sll_ifindex: ifindex,
        sll_hatype: 1,
        sll_pkttype: 0,
        sll_halen: 6,
        sll_addr: [0; 8],
    };

    let res = unsafe {
        libc::bind(
            fd,
            &sockaddr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };

    if res < 0 {
        Err(Error::Io(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

fn set_recv_timeout(fd: RawFd, timeout_ms: u64) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: (timeout_ms / 1000) as libc::time_t,
        tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
    };

    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };

    if res < 0 {
        Err(Error::Io(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface() {
        // Either the socket cannot be opened at all (unprivileged test
        // run) or the nonsense name is rejected.
        match RawSocket::open("lanlink-does-not-exist-0") {
            Err(Error::InterfaceNotFound(name)) => {
                assert_eq!(name, "lanlink-does-not-exist-0");
            }
            Err(Error::PermissionDenied) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_name_too_long() {
        let long = "x".repeat(64);
        assert!(ifreq_for(&long).is_err());
        assert!(ifreq_for("eth0").is_ok());
    }
}
