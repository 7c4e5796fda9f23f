//! Live capture over a Linux `AF_PACKET` raw socket.
//!
//! Opens `SOCK_RAW / ETH_P_ALL` bound to a single interface, so every frame
//! seen by that interface (both directions) is delivered with its link-layer
//! header intact. Requires `CAP_NET_RAW`.
//!
//! Reads are bounded with `poll(2)` so the capture loop can honour its
//! deadline without a busy loop.

use std::any::Any;
use std::time::Duration;

use super::{CaptureError, FrameRead, PacketSource};
#[cfg(target_os = "linux")]
use super::RxFrame;
use crate::handshake::LinkType;

/// Snapshot length: frames are truncated to this many bytes.
pub const SNAPLEN: usize = 65536;

/// Live capture source backed by an `AF_PACKET` socket.
pub struct AfPacketSource {
    fd: i32,
    interface: String,
    link: LinkType,
    buf: Vec<u8>,
}

// SAFETY: AfPacketSource owns a single file descriptor; no interior mutability.
unsafe impl Send for AfPacketSource {}

impl AfPacketSource {
    /// Open a capture socket on `interface`.
    ///
    /// # Errors
    /// `InterfaceNotFound` if the name does not resolve to an index,
    /// `PermissionDenied` without `CAP_NET_RAW`, `Socket` for other failures.
    #[cfg(target_os = "linux")]
    pub fn open(interface: &str) -> Result<Self, CaptureError> {
        let c_name = std::ffi::CString::new(interface)
            .map_err(|_| CaptureError::InterfaceNotFound(interface.to_string()))?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(CaptureError::InterfaceNotFound(interface.to_string()));
        }

        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol as libc::c_int) };
        if fd < 0 {
            return Err(os_error(interface, "AF_PACKET socket creation failed"));
        }

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex as libc::c_int;

        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = os_error(interface, "bind to interface failed");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let link = read_link_type(interface);
        tracing::info!(interface = %interface, ifindex, ?link, "AF_PACKET capture socket open");

        Ok(Self {
            fd,
            interface: interface.to_string(),
            link,
            buf: vec![0u8; SNAPLEN],
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_interface: &str) -> Result<Self, CaptureError> {
        Err(CaptureError::Unsupported)
    }
}

#[cfg(target_os = "linux")]
fn os_error(interface: &str, context: &str) -> CaptureError {
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        CaptureError::PermissionDenied {
            interface: interface.to_string(),
        }
    } else {
        CaptureError::Socket(format!("{context} on '{interface}': {err}"))
    }
}

/// Read the interface hardware type from sysfs. Defaults to Ethernet.
fn read_link_type(interface: &str) -> LinkType {
    std::fs::read_to_string(format!("/sys/class/net/{interface}/type"))
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .map(LinkType::from_arphrd)
        .unwrap_or(LinkType::Ethernet)
}

impl Drop for AfPacketSource {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if self.fd >= 0 {
                unsafe { libc::close(self.fd) };
            }
        }
    }
}

impl PacketSource for AfPacketSource {
    #[cfg(target_os = "linux")]
    fn poll_frame(&mut self, timeout: Duration) -> Result<FrameRead, CaptureError> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(FrameRead::Idle);
            }
            return Err(CaptureError::Socket(format!("poll failed: {err}")));
        }
        if ready == 0 {
            return Ok(FrameRead::Idle);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Ok(FrameRead::Closed);
        }

        let n = unsafe {
            libc::recv(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {
                    Ok(FrameRead::Idle)
                }
                _ => Err(CaptureError::Socket(format!("recv failed: {err}"))),
            };
        }

        Ok(FrameRead::Frame(RxFrame {
            data: self.buf[..n as usize].to_vec(),
        }))
    }

    #[cfg(not(target_os = "linux"))]
    fn poll_frame(&mut self, _timeout: Duration) -> Result<FrameRead, CaptureError> {
        Err(CaptureError::Unsupported)
    }

    fn link_type(&self) -> LinkType {
        self.link
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
