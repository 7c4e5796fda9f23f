//! Link-layer demultiplexing of captured frames.
//!
//! Turns raw frame bytes into a [`DecodedPacket`]. Anything that fails to
//! slice, or slices to a non-TCP transport, becomes a packet without a TCP
//! layer rather than an error.

use std::net::IpAddr;

use etherparse::{InternetSlice, SlicedPacket, TransportSlice};

use super::{DecodedPacket, TcpFlags, TcpSegment};

/// Framing of frames delivered by a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II header (also used by the Linux loopback device).
    Ethernet,
    /// No link header, frame starts at the IP header (tun, wireguard).
    RawIp,
}

impl LinkType {
    /// Map a Linux `ARPHRD_*` hardware type to a link type.
    ///
    /// Unknown types fall back to Ethernet.
    pub fn from_arphrd(hw_type: u16) -> Self {
        match hw_type {
            // ARPHRD_NONE, ARPHRD_IPGRE, ARPHRD_TUNNEL, ARPHRD_TUNNEL6
            65534 | 778 | 768 | 769 => Self::RawIp,
            _ => Self::Ethernet,
        }
    }
}

/// Decode one captured frame.
pub fn decode_frame(data: &[u8], link: LinkType) -> DecodedPacket {
    let tcp = slice(data, link).and_then(|sliced| match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(TcpSegment {
            source_port: tcp.source_port(),
            dest_port: tcp.destination_port(),
            flags: TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                rst: tcp.rst(),
                fin: tcp.fin(),
            },
        }),
        _ => None,
    });
    DecodedPacket {
        len: data.len(),
        tcp,
    }
}

/// Source and destination IP addresses of a frame, if it carries IP.
pub fn ip_endpoints(data: &[u8], link: LinkType) -> Option<(IpAddr, IpAddr)> {
    let sliced = slice(data, link)?;
    match sliced.net {
        Some(InternetSlice::Ipv4(ip)) => {
            let h = ip.header();
            Some((IpAddr::V4(h.source_addr()), IpAddr::V4(h.destination_addr())))
        }
        Some(InternetSlice::Ipv6(ip)) => {
            let h = ip.header();
            Some((IpAddr::V6(h.source_addr()), IpAddr::V6(h.destination_addr())))
        }
        _ => None,
    }
}

fn slice(data: &[u8], link: LinkType) -> Option<SlicedPacket<'_>> {
    match link {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok(),
        LinkType::RawIp => SlicedPacket::from_ip(data).ok(),
    }
}
