//! Diagnostic engine — runs one capture + conntrack snapshot.
//!
//! Wires the capture producer to the handshake classifier, reads the
//! conntrack table once the capture window closes, and composes the result.
//! An unavailable evidence source degrades the report instead of aborting it.

use std::path::PathBuf;
use std::time::Duration;

use crate::capture::{
    detect_default_interface, spawn_capture, AfPacketSource, CaptureError, CaptureFilter,
    CaptureStop, FilterError, PacketSource, MAX_CAPTURE_DURATION,
};
use crate::conntrack::{count_states, read_table, ConntrackCounters, DEFAULT_CONNTRACK_PATH};
use crate::handshake::{classify_stream, HandshakeStats};
use crate::report::{build_result, Degradation, DiagnosticResult, Evidence};

/// Default capture window.
pub const DEFAULT_DURATION_SECS: u64 = 30;

/// Configuration for a diagnostic run.
///
/// ## Environment variables
///
/// | Variable                 | Default                  |
/// |--------------------------|--------------------------|
/// | `TCPDIAG_INTERFACE`      | auto-detected            |
/// | `TCPDIAG_DURATION_SECS`  | 30                       |
/// | `TCPDIAG_FILTER`         | (none)                   |
/// | `TCPDIAG_CONNTRACK_PATH` | /proc/net/nf_conntrack   |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnoseConfig {
    /// Capture interface (None = default route interface).
    pub interface: Option<String>,
    /// Capture window.
    pub duration: Duration,
    /// Capture filter expression.
    pub filter: String,
    /// Conntrack table location.
    pub conntrack_path: PathBuf,
}

impl Default for DiagnoseConfig {
    fn default() -> Self {
        Self {
            interface: None,
            duration: Duration::from_secs(DEFAULT_DURATION_SECS),
            filter: String::new(),
            conntrack_path: PathBuf::from(DEFAULT_CONNTRACK_PATH),
        }
    }
}

impl DiagnoseConfig {
    /// Build from `TCPDIAG_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let duration = match lookup("TCPDIAG_DURATION_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    tracing::warn!(value = %raw, "ignoring invalid TCPDIAG_DURATION_SECS");
                    defaults.duration
                }
            },
            None => defaults.duration,
        };

        Self {
            interface: lookup("TCPDIAG_INTERFACE").filter(|s| !s.is_empty()),
            duration,
            filter: lookup("TCPDIAG_FILTER").unwrap_or(defaults.filter),
            conntrack_path: lookup("TCPDIAG_CONNTRACK_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.conntrack_path),
        }
    }
}

/// Run a diagnostic on the configured live interface.
///
/// Only an invalid filter expression is an error; capture and conntrack
/// failures are recorded as degradations in the result.
pub async fn run_diagnosis(config: &DiagnoseConfig) -> Result<DiagnosticResult, FilterError> {
    let filter = CaptureFilter::parse(&config.filter)?;

    let interface = match &config.interface {
        Some(iface) => Ok(iface.clone()),
        None => detect_default_interface(),
    };
    let resolved = interface.as_ref().ok().cloned();
    let source = interface.and_then(|iface| AfPacketSource::open(&iface));

    let mut result = diagnose_with(source, filter, config).await;
    if result.interface.is_none() {
        result.interface = resolved;
    }
    Ok(result)
}

/// Run a diagnostic against an already-opened (or failed) packet source.
pub async fn diagnose_with<S>(
    source: Result<S, CaptureError>,
    filter: CaptureFilter,
    config: &DiagnoseConfig,
) -> DiagnosticResult
where
    S: PacketSource + 'static,
{
    let mut degradations = Vec::new();

    let interface = source.as_ref().ok().map(|s| s.interface().to_string());
    let (tcp_stats, packets_captured) = match source {
        Ok(source) => capture_handshakes(source, filter, config.duration, &mut degradations).await,
        Err(e) => {
            tracing::warn!(error = %e, "packet capture unavailable, continuing without it");
            if let Some(hint) = e.hint() {
                tracing::warn!("{hint}");
            }
            degradations.push(Degradation::Capture(e.to_string()));
            (HandshakeStats::empty(), 0)
        }
    };

    let conntrack = snapshot_conntrack(config, &mut degradations);

    build_result(Evidence {
        interface,
        duration: config.duration.min(MAX_CAPTURE_DURATION),
        packets_captured,
        tcp_stats,
        conntrack,
        degradations,
    })
}

async fn capture_handshakes<S>(
    source: S,
    filter: CaptureFilter,
    duration: Duration,
    degradations: &mut Vec<Degradation>,
) -> (HandshakeStats, u64)
where
    S: PacketSource + 'static,
{
    let interface = source.interface().to_string();
    tracing::info!(interface = %interface, secs = duration.as_secs(), filter = %filter, "capturing");

    let (handle, packets) = spawn_capture(source, filter, duration);
    let stats = classify_stream(packets).await;
    let captured = handle.packets_captured();

    match handle.join().await {
        Ok(CaptureStop::DurationElapsed) | Ok(CaptureStop::SourceClosed) => {}
        Ok(CaptureStop::ConsumerGone) => {
            tracing::debug!(interface = %interface, "classifier stopped before capture")
        }
        Err(e) => {
            tracing::warn!(interface = %interface, error = %e, "capture ended early");
            degradations.push(Degradation::Capture(format!("capture ended early: {e}")));
        }
    }

    tracing::info!(
        packets = captured,
        syn = stats.syn_sent,
        syn_ack = stats.syn_ack_received,
        rst = stats.rst_received,
        "capture complete"
    );
    (stats, captured)
}

fn snapshot_conntrack(
    config: &DiagnoseConfig,
    degradations: &mut Vec<Degradation>,
) -> ConntrackCounters {
    match read_table(&config.conntrack_path) {
        Ok(records) => count_states(&records),
        Err(e) => {
            tracing::warn!(error = %e, "could not read conntrack, using empty counters");
            degradations.push(Degradation::Conntrack(e.to_string()));
            ConntrackCounters::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MockPacketSource;
    use crate::handshake::LinkType;
    use etherparse::PacketBuilder;
    use std::collections::HashMap;
    use std::io::Write;

    fn syn_frame(ack: bool) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(41000, 443, 1, 1024)
            .syn();
        let builder = if ack { builder.ack(2) } else { builder };
        let mut buf = Vec::new();
        builder.write(&mut buf, &[]).unwrap();
        buf
    }

    fn conntrack_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ipv4 2 tcp 6 431999 ESTABLISHED src=10.0.0.1 dst=10.0.0.2 sport=41000 dport=443 src=10.0.0.2 dst=10.0.0.1 sport=443 dport=41000 [ASSURED] mark=0 use=2").unwrap();
        writeln!(file, "ipv4 2 tcp 6 30 SYN_SENT src=10.0.0.1 dst=10.0.0.3 sport=41001 dport=443 [UNREPLIED] src=10.0.0.3 dst=10.0.0.1 sport=443 dport=41001 mark=0 use=2").unwrap();
        file
    }

    fn config(conntrack_path: PathBuf) -> DiagnoseConfig {
        DiagnoseConfig {
            interface: None,
            duration: Duration::from_secs(5),
            filter: String::new(),
            conntrack_path,
        }
    }

    #[test]
    fn test_config_defaults() {
        let cfg = DiagnoseConfig::from_lookup(|_| None);
        assert_eq!(cfg, DiagnoseConfig::default());
        assert_eq!(cfg.duration, Duration::from_secs(30));
        assert_eq!(cfg.conntrack_path, PathBuf::from("/proc/net/nf_conntrack"));
    }

    #[test]
    fn test_config_from_env_values() {
        let env: HashMap<&str, &str> = [
            ("TCPDIAG_INTERFACE", "eth1"),
            ("TCPDIAG_DURATION_SECS", "10"),
            ("TCPDIAG_FILTER", "tcp port 443"),
            ("TCPDIAG_CONNTRACK_PATH", "/tmp/ct"),
        ]
        .into_iter()
        .collect();
        let cfg = DiagnoseConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.interface.as_deref(), Some("eth1"));
        assert_eq!(cfg.duration, Duration::from_secs(10));
        assert_eq!(cfg.filter, "tcp port 443");
        assert_eq!(cfg.conntrack_path, PathBuf::from("/tmp/ct"));
    }

    #[test]
    fn test_config_invalid_duration_falls_back() {
        let cfg = DiagnoseConfig::from_lookup(|k| {
            (k == "TCPDIAG_DURATION_SECS").then(|| "0".to_string())
        });
        assert_eq!(cfg.duration, Duration::from_secs(DEFAULT_DURATION_SECS));
    }

    #[tokio::test]
    async fn test_diagnose_with_mock_source() {
        let mut source = MockPacketSource::new(LinkType::Ethernet);
        source.queue_frame(syn_frame(false));
        source.queue_frame(syn_frame(true));
        source.queue_frame(syn_frame(false));
        source.queue_frame(vec![0u8; 14]);

        let ct = conntrack_file();
        let cfg = config(ct.path().to_path_buf());
        let result = diagnose_with(Ok(source), CaptureFilter::any(), &cfg).await;

        assert_eq!(result.interface.as_deref(), Some("mock0"));
        assert_eq!(result.packets_captured, 4);
        assert_eq!(result.tcp_stats.syn_sent, 2);
        assert_eq!(result.tcp_stats.syn_ack_received, 1);
        assert_eq!(result.tcp_stats.syn_ack_ratio, 50.0);
        assert_eq!(result.conntrack.total, 2);
        assert_eq!(result.conntrack.established, 1);
        assert_eq!(result.conntrack.syn_sent, 1);
        assert_eq!(result.duration_secs, 5);
        assert!(!result.is_degraded());
    }

    #[tokio::test]
    async fn test_missing_conntrack_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path().join("nf_conntrack"));
        let mut source = MockPacketSource::new(LinkType::Ethernet);
        source.queue_frame(syn_frame(false));

        let result = diagnose_with(Ok(source), CaptureFilter::any(), &cfg).await;

        assert_eq!(result.tcp_stats.syn_sent, 1);
        assert_eq!(result.conntrack, ConntrackCounters::default());
        assert!(result.is_degraded());
        assert!(result.warnings[0].contains("conntrack table unavailable"));
    }

    #[tokio::test]
    async fn test_unavailable_capture_degrades() {
        let ct = conntrack_file();
        let cfg = config(ct.path().to_path_buf());
        let source: Result<MockPacketSource, CaptureError> = Err(CaptureError::PermissionDenied {
            interface: "eth0".to_string(),
        });

        let result = diagnose_with(source, CaptureFilter::any(), &cfg).await;

        assert_eq!(result.packets_captured, 0);
        assert_eq!(result.tcp_stats, HandshakeStats::empty());
        assert_eq!(result.conntrack.total, 2);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("packet capture unavailable"));
        assert!(result.recommendation.contains("CAP_NET_RAW"));
    }

    #[tokio::test]
    async fn test_capture_error_midway_keeps_partial_stats() {
        let ct = conntrack_file();
        let cfg = config(ct.path().to_path_buf());
        let mut source = MockPacketSource::new(LinkType::Ethernet);
        source.queue_frame(syn_frame(false));
        source.queue_error(CaptureError::Socket("network is down".to_string()));

        let result = diagnose_with(Ok(source), CaptureFilter::any(), &cfg).await;

        assert_eq!(result.tcp_stats.syn_sent, 1);
        assert!(result.warnings[0].contains("capture ended early"));
    }

    #[tokio::test]
    async fn test_huge_duration_is_clamped() {
        let ct = conntrack_file();
        let mut cfg = config(ct.path().to_path_buf());
        cfg.duration = Duration::from_secs(u64::MAX);
        let mut source = MockPacketSource::new(LinkType::Ethernet);
        source.queue_frame(syn_frame(false));

        let result = diagnose_with(Ok(source), CaptureFilter::any(), &cfg).await;

        assert_eq!(result.tcp_stats.syn_sent, 1);
        assert_eq!(result.duration_secs, MAX_CAPTURE_DURATION.as_secs());
        assert!(!result.is_degraded());
    }

    #[tokio::test]
    async fn test_run_diagnosis_rejects_bad_filter() {
        let mut cfg = DiagnoseConfig::default();
        cfg.filter = "udp port 53".to_string();
        let err = run_diagnosis(&cfg).await.unwrap_err();
        assert!(matches!(err, FilterError::Unsupported(_)));
    }
}
