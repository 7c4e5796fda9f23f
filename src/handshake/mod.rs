//! TCP handshake classifier.
//!
//! Counts handshake initiation (SYN), confirmation (SYN-ACK) and abort (RST)
//! signals in a stream of decoded packets. This is flag counting, not
//! per-connection session tracking: every packet is classified on its own.

pub mod decode;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use decode::{decode_frame, LinkType};

// ─────────────────────────────────────────────────────────────────────────────
// Packet model
// ─────────────────────────────────────────────────────────────────────────────

/// TCP control flags relevant to handshake classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
    pub fin: bool,
}

impl TcpFlags {
    /// Classify a flag combination into a handshake event.
    ///
    /// Only three combinations are counted:
    /// - SYN without ACK or RST: connection attempt
    /// - SYN with ACK, without RST: attempt confirmed
    /// - RST without SYN: reset
    ///
    /// Everything else (ACK-only, FIN, SYN+RST, bare data) returns `None`.
    pub fn classify(&self) -> Option<HandshakeEvent> {
        match (self.syn, self.ack, self.rst) {
            (true, false, false) => Some(HandshakeEvent::Syn),
            (true, true, false) => Some(HandshakeEvent::SynAck),
            (false, _, true) => Some(HandshakeEvent::Rst),
            _ => None,
        }
    }
}

/// The TCP layer of a decoded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    /// Source port.
    pub source_port: u16,
    /// Destination port.
    pub dest_port: u16,
    /// Control flags.
    pub flags: TcpFlags,
}

/// A decoded packet as delivered by the capture source.
///
/// `tcp` is `None` for non-TCP traffic and for frames that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedPacket {
    /// Captured length in bytes.
    pub len: usize,
    /// TCP layer, if present and decodable.
    pub tcp: Option<TcpSegment>,
}

impl DecodedPacket {
    /// A packet carrying a TCP segment with the given flags.
    pub fn tcp(source_port: u16, dest_port: u16, flags: TcpFlags) -> Self {
        Self {
            len: 0,
            tcp: Some(TcpSegment {
                source_port,
                dest_port,
                flags,
            }),
        }
    }

    /// A packet with no TCP layer.
    pub fn non_tcp(len: usize) -> Self {
        Self { len, tcp: None }
    }
}

/// Handshake signal derived from a single packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// SYN sent, no ACK.
    Syn,
    /// SYN-ACK received.
    SynAck,
    /// RST received.
    Rst,
}

impl std::fmt::Display for HandshakeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syn => write!(f, "syn"),
            Self::SynAck => write!(f, "syn-ack"),
            Self::Rst => write!(f, "rst"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Accumulator and finalized stats
// ─────────────────────────────────────────────────────────────────────────────

/// Finalized handshake counters for one capture session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HandshakeStats {
    /// Packets with SYN set and ACK clear.
    pub syn_sent: u64,
    /// Packets with SYN and ACK set.
    pub syn_ack_received: u64,
    /// Packets with RST set and SYN clear.
    pub rst_received: u64,
    /// `syn_ack_received / syn_sent * 100`, or 0 when no SYN was seen.
    #[serde(rename = "syn_ack_ratio_percent")]
    pub syn_ack_ratio: f64,
}

impl HandshakeStats {
    /// All-zero stats.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Mutable, single-writer accumulator for one capture session.
///
/// Owned exclusively by the classification task. Consumed by [`finish`],
/// which computes the SYN-ACK ratio exactly once.
///
/// [`finish`]: HandshakeCounter::finish
#[derive(Debug, Default)]
pub struct HandshakeCounter {
    syn_sent: u64,
    syn_ack_received: u64,
    rst_received: u64,
}

impl HandshakeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one packet and bump the matching counter.
    ///
    /// Packets without a TCP layer are ignored.
    pub fn observe(&mut self, packet: &DecodedPacket) -> Option<HandshakeEvent> {
        let event = packet.tcp.as_ref()?.flags.classify()?;
        match event {
            HandshakeEvent::Syn => self.syn_sent += 1,
            HandshakeEvent::SynAck => self.syn_ack_received += 1,
            HandshakeEvent::Rst => self.rst_received += 1,
        }
        Some(event)
    }

    /// Finalize the counters.
    pub fn finish(self) -> HandshakeStats {
        let syn_ack_ratio = if self.syn_sent > 0 {
            self.syn_ack_received as f64 / self.syn_sent as f64 * 100.0
        } else {
            0.0
        };
        HandshakeStats {
            syn_sent: self.syn_sent,
            syn_ack_received: self.syn_ack_received,
            rst_received: self.rst_received,
            syn_ack_ratio,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Classification entry points
// ─────────────────────────────────────────────────────────────────────────────

/// Classify an in-memory packet sequence in order.
pub fn classify_packets<'a, I>(packets: I) -> HandshakeStats
where
    I: IntoIterator<Item = &'a DecodedPacket>,
{
    let mut counter = HandshakeCounter::new();
    for packet in packets {
        counter.observe(packet);
    }
    counter.finish()
}

/// Consume packets from a concurrent producer until every sender is dropped.
///
/// The only suspension point is waiting for the next packet. End of stream
/// (capture duration elapsed or device closed) finalizes the stats.
pub async fn classify_stream(mut packets: mpsc::Receiver<DecodedPacket>) -> HandshakeStats {
    let mut counter = HandshakeCounter::new();
    let mut seen: u64 = 0;
    while let Some(packet) = packets.recv().await {
        seen += 1;
        if let Some(event) = counter.observe(&packet) {
            tracing::trace!(%event, "handshake event");
        }
    }
    let stats = counter.finish();
    tracing::debug!(
        packets = seen,
        syn = stats.syn_sent,
        syn_ack = stats.syn_ack_received,
        rst = stats.rst_received,
        "packet stream closed, handshake stats finalized"
    );
    stats
}
