//! tcpdiag — point-in-time TCP connectivity health snapshot.
//!
//! Correlates two independent evidence streams: live link-layer capture
//! classified into TCP handshake events, and the kernel conntrack table.
//! Usable as a library or via the CLI.

pub mod capture;
pub mod cli;
pub mod conntrack;
pub mod engine;
pub mod handshake;
pub mod report;

// Re-export key types for library users.
pub use capture::{CaptureError, CaptureFilter, MockPacketSource, PacketSource};
pub use conntrack::{count_states, parse_line, read_table, ConnectionRecord, ConntrackCounters};
pub use engine::{diagnose_with, run_diagnosis, DiagnoseConfig};
pub use handshake::{
    classify_packets, classify_stream, DecodedPacket, HandshakeCounter, HandshakeStats, TcpFlags,
};
pub use report::{build_result, Degradation, DiagnosticResult, Evidence};
