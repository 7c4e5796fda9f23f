//! Diagnostic result model.
//!
//! Composes finalized handshake stats and conntrack counters into a
//! [`DiagnosticResult`] with a templated summary and recommendation.
//! Rendering to JSON or Markdown lives in `cli::output`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conntrack::ConntrackCounters;
use crate::handshake::HandshakeStats;

/// SYN-ACK ratio (percent) below which loss or filtering is suspected.
pub const LOW_SYN_ACK_RATIO: f64 = 50.0;

/// Share of UNREPLIED conntrack entries (percent) considered unhealthy.
pub const HIGH_UNREPLIED_SHARE: f64 = 20.0;

// ─────────────────────────────────────────────────────────────────────────────
// Degradation
// ─────────────────────────────────────────────────────────────────────────────

/// An evidence source that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "reason", rename_all = "snake_case")]
pub enum Degradation {
    /// Live capture could not be opened or failed; handshake stats are empty.
    Capture(String),
    /// The conntrack table could not be read; counters are empty.
    Conntrack(String),
}

impl std::fmt::Display for Degradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capture(reason) => write!(f, "packet capture unavailable: {reason}"),
            Self::Conntrack(reason) => write!(f, "conntrack table unavailable: {reason}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Result
// ─────────────────────────────────────────────────────────────────────────────

/// Everything gathered by one diagnostic run, before narration.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    /// Capture interface, if one was requested.
    pub interface: Option<String>,
    /// Declared capture duration.
    pub duration: Duration,
    /// Packets delivered by the capture source.
    pub packets_captured: u64,
    pub tcp_stats: HandshakeStats,
    pub conntrack: ConntrackCounters,
    pub degradations: Vec<Degradation>,
}

/// Report-ready diagnostic snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticResult {
    /// Unique identifier for this report.
    pub report_id: Uuid,
    /// Time the result was composed.
    pub generated_at: DateTime<Utc>,
    /// Capture interface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Declared capture duration in seconds.
    pub duration_secs: u64,
    pub packets_captured: u64,
    pub tcp_stats: HandshakeStats,
    #[serde(rename = "conntrack_counters")]
    pub conntrack: ConntrackCounters,
    pub summary: String,
    pub recommendation: String,
    /// Human-readable notes for each degraded evidence source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl DiagnosticResult {
    /// True if any evidence source was unavailable.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Compose the final result.
pub fn build_result(evidence: Evidence) -> DiagnosticResult {
    let summary = summarize(&evidence);
    let recommendation = recommend(&evidence);
    DiagnosticResult {
        report_id: Uuid::new_v4(),
        generated_at: Utc::now(),
        interface: evidence.interface,
        duration_secs: evidence.duration.as_secs(),
        packets_captured: evidence.packets_captured,
        tcp_stats: evidence.tcp_stats,
        conntrack: evidence.conntrack,
        summary,
        recommendation,
        warnings: evidence.degradations.iter().map(|d| d.to_string()).collect(),
    }
}

fn summarize(e: &Evidence) -> String {
    format!(
        "Captured {} packets, {} SYN sent, {:.1}% SYN-ACK ratio, {} conntrack entries",
        e.packets_captured, e.tcp_stats.syn_sent, e.tcp_stats.syn_ack_ratio, e.conntrack.total
    )
}

fn recommend(e: &Evidence) -> String {
    let tcp = &e.tcp_stats;
    let capture_degraded = e
        .degradations
        .iter()
        .any(|d| matches!(d, Degradation::Capture(_)));

    if capture_degraded {
        return "Packet capture was unavailable; rerun with CAP_NET_RAW (e.g. sudo) \
                to obtain handshake statistics."
            .to_string();
    }
    if tcp.syn_sent == 0 {
        return "No outbound SYN packets observed; generate traffic during the capture \
                window or widen the capture filter."
            .to_string();
    }
    if tcp.syn_ack_ratio < LOW_SYN_ACK_RATIO {
        return format!(
            "SYN-ACK ratio is low ({:.1}%); this may indicate packet loss, filtering, \
             or unreachable peers. Check upstream connectivity and firewall rules.",
            tcp.syn_ack_ratio
        );
    }
    if tcp.rst_received > tcp.syn_ack_received {
        return format!(
            "More resets ({}) than SYN-ACKs ({}); peers are actively refusing \
             connections. Verify target services are listening.",
            tcp.rst_received, tcp.syn_ack_received
        );
    }
    if unreplied_share(&e.conntrack) > HIGH_UNREPLIED_SHARE {
        return format!(
            "{} of {} tracked connections are unreplied; check NAT and return-path routing.",
            e.conntrack.unreplied, e.conntrack.total
        );
    }
    "Handshake completion looks healthy; no action needed.".to_string()
}

fn unreplied_share(c: &ConntrackCounters) -> f64 {
    if c.total == 0 {
        return 0.0;
    }
    c.unreplied as f64 / c.total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(syn: u64, syn_ack: u64, rst: u64) -> HandshakeStats {
        let ratio = if syn > 0 {
            syn_ack as f64 / syn as f64 * 100.0
        } else {
            0.0
        };
        HandshakeStats {
            syn_sent: syn,
            syn_ack_received: syn_ack,
            rst_received: rst,
            syn_ack_ratio: ratio,
        }
    }

    fn evidence(tcp_stats: HandshakeStats) -> Evidence {
        Evidence {
            interface: Some("eth0".to_string()),
            duration: Duration::from_secs(30),
            packets_captured: 500,
            tcp_stats,
            conntrack: ConntrackCounters {
                total: 100,
                established: 90,
                syn_sent: 5,
                unreplied: 3,
                other: 2,
            },
            degradations: vec![],
        }
    }

    #[test]
    fn test_summary_template() {
        let result = build_result(evidence(tcp(10, 8, 1)));
        assert_eq!(
            result.summary,
            "Captured 500 packets, 10 SYN sent, 80.0% SYN-ACK ratio, 100 conntrack entries"
        );
        assert_eq!(result.duration_secs, 30);
        assert!(!result.is_degraded());
    }

    #[test]
    fn test_healthy_recommendation() {
        let result = build_result(evidence(tcp(10, 8, 1)));
        assert!(result.recommendation.contains("healthy"));
    }

    #[test]
    fn test_low_ratio_flags_packet_loss() {
        let result = build_result(evidence(tcp(10, 2, 0)));
        assert!(result.recommendation.contains("packet loss"));
        assert!(result.recommendation.contains("20.0%"));
    }

    #[test]
    fn test_no_syn_recommendation() {
        let result = build_result(evidence(tcp(0, 0, 0)));
        assert!(result.recommendation.contains("No outbound SYN"));
    }

    #[test]
    fn test_resets_exceed_syn_acks() {
        let result = build_result(evidence(tcp(10, 6, 9)));
        assert!(result.recommendation.contains("resets"));
    }

    #[test]
    fn test_unreplied_share() {
        let mut e = evidence(tcp(10, 9, 0));
        e.conntrack = ConntrackCounters {
            total: 10,
            established: 5,
            syn_sent: 0,
            unreplied: 5,
            other: 0,
        };
        let result = build_result(e);
        assert!(result.recommendation.contains("5 of 10"));
    }

    #[test]
    fn test_degradations_become_warnings() {
        let mut e = evidence(HandshakeStats::empty());
        e.packets_captured = 0;
        e.degradations = vec![
            Degradation::Capture("permission denied".to_string()),
            Degradation::Conntrack("not found".to_string()),
        ];
        let result = build_result(e);
        assert!(result.is_degraded());
        assert_eq!(result.warnings.len(), 2);
        assert_eq!(result.warnings[0], "packet capture unavailable: permission denied");
        assert!(result.recommendation.contains("CAP_NET_RAW"));
    }

    #[test]
    fn test_result_json_field_names() {
        let result = build_result(evidence(tcp(10, 8, 1)));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["tcp_stats"]["syn_ack_ratio_percent"], 80.0);
        assert_eq!(json["conntrack_counters"]["established"], 90);
        assert_eq!(json["packets_captured"], 500);
        assert!(json.get("warnings").is_none());
    }
}
