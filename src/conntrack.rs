//! Connection-tracking table reader.
//!
//! Parses the kernel's `nf_conntrack` text table into [`ConnectionRecord`]s
//! and folds them into per-state [`ConntrackCounters`].
//!
//! Line format (fields separated by runs of whitespace):
//!
//! ```text
//! ipv4 2 tcp 6 431999 ESTABLISHED src=.. dst=.. sport=.. dport=.. src=.. dst=.. sport=.. dport=.. [ASSURED] mark=0 use=2
//! ```
//!
//! Each line carries two directional tuples (original and reply). A key that
//! repeats later in the line overwrites the earlier value, so address and port
//! fields end up holding the reply tuple whenever one is present.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default location of the live conntrack table.
pub const DEFAULT_CONNTRACK_PATH: &str = "/proc/net/nf_conntrack";

/// Token index of the transport protocol name.
const PROTO_INDEX: usize = 2;
/// Token index of the positional state string.
const STATE_INDEX: usize = 5;
/// First token index scanned for `key=value` fields.
const KV_START_INDEX: usize = 6;

/// State label assigned when no state is present but a timeout is.
pub const STATE_UNREPLIED: &str = "UNREPLIED";
pub const STATE_ESTABLISHED: &str = "ESTABLISHED";
pub const STATE_SYN_SENT: &str = "SYN_SENT";

/// Error reading the conntrack table.
///
/// Individual malformed lines never produce an error; only an unreadable
/// source does.
#[derive(Debug, thiserror::Error)]
pub enum ConntrackError {
    #[error("permission denied reading {path} (requires root or CAP_NET_ADMIN)")]
    PermissionDenied { path: PathBuf },

    #[error("conntrack table not found at {path} (is nf_conntrack loaded?)")]
    NotFound { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConntrackError {
    fn from_io(path: &Path, source: std::io::Error) -> Self {
        let path = path.to_path_buf();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Read { path, source },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// One parsed row of the conntrack table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionRecord {
    /// Transport protocol ("tcp", "udp", ...), empty if the line was too short.
    pub protocol: String,
    /// Connection state, possibly inferred; may be empty.
    pub state: String,
    pub source_address: String,
    pub dest_address: String,
    pub source_port: String,
    pub dest_port: String,
    /// Value of the last `timeout=` key, 0 if missing or unparsable.
    pub timeout_seconds: u64,
}

impl ConnectionRecord {
    /// A record with only a state set.
    pub fn with_state(state: &str) -> Self {
        Self {
            state: state.to_string(),
            ..Self::default()
        }
    }
}

/// Parse one table line.
///
/// Returns `None` only for lines with no tokens at all. Short lines still
/// produce a record with whatever could be recovered.
pub fn parse_line(line: &str) -> Option<ConnectionRecord> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.is_empty() {
        return None;
    }

    let mut record = ConnectionRecord {
        protocol: fields.get(PROTO_INDEX).copied().unwrap_or_default().to_string(),
        ..ConnectionRecord::default()
    };

    for field in fields.iter().skip(KV_START_INDEX) {
        // Bracketed flags like [ASSURED] have no '='
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "src" => record.source_address = value.to_string(),
            "dst" => record.dest_address = value.to_string(),
            "sport" => record.source_port = value.to_string(),
            "dport" => record.dest_port = value.to_string(),
            "tcp_state" => record.state = value.to_string(),
            "timeout" => record.timeout_seconds = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    if record.state.is_empty() {
        if let Some(state) = fields.get(STATE_INDEX) {
            record.state = state.to_string();
        }
    }

    if record.state.is_empty() && record.timeout_seconds > 0 {
        record.state = STATE_UNREPLIED.to_string();
    }

    Some(record)
}

/// Parse the full text of the table.
///
/// Blank lines are skipped; lines too short to carry a state token are kept
/// but logged.
pub fn parse_table(content: &str) -> Vec<ConnectionRecord> {
    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let Some(record) = parse_line(line) else {
            continue;
        };
        if line.split_whitespace().count() <= STATE_INDEX {
            tracing::warn!(
                line = idx + 1,
                protocol = %record.protocol,
                state = %record.state,
                "short conntrack line"
            );
        }
        records.push(record);
    }
    records
}

/// Read and parse the conntrack table at `path`.
pub fn read_table(path: impl AsRef<Path>) -> Result<Vec<ConnectionRecord>, ConntrackError> {
    let path = path.as_ref();
    let content =
        std::fs::read_to_string(path).map_err(|e| ConntrackError::from_io(path, e))?;
    let records = parse_table(&content);
    tracing::debug!(path = %path.display(), records = records.len(), "conntrack table read");
    Ok(records)
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregation
// ─────────────────────────────────────────────────────────────────────────────

/// Per-state counts over a set of conntrack records.
///
/// `total` always equals the sum of the four buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConntrackCounters {
    pub total: u64,
    pub established: u64,
    pub syn_sent: u64,
    pub unreplied: u64,
    pub other: u64,
}

impl ConntrackCounters {
    /// Fold one record in.
    pub fn add(&mut self, record: &ConnectionRecord) {
        match record.state.as_str() {
            STATE_ESTABLISHED => self.established += 1,
            STATE_SYN_SENT => self.syn_sent += 1,
            STATE_UNREPLIED => self.unreplied += 1,
            _ => self.other += 1,
        }
        self.total += 1;
    }

    /// Combine two partial counts.
    pub fn merge(self, other: Self) -> Self {
        Self {
            total: self.total + other.total,
            established: self.established + other.established,
            syn_sent: self.syn_sent + other.syn_sent,
            unreplied: self.unreplied + other.unreplied,
            other: self.other + other.other,
        }
    }
}

/// Count records by state (case-sensitive match).
pub fn count_states<'a, I>(records: I) -> ConntrackCounters
where
    I: IntoIterator<Item = &'a ConnectionRecord>,
{
    records
        .into_iter()
        .fold(ConntrackCounters::default(), |mut counters, record| {
            counters.add(record);
            counters
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ESTABLISHED_LINE: &str = "ipv4     2 tcp      6 431999 ESTABLISHED src=192.168.1.10 dst=93.184.216.34 sport=54321 dport=443 src=93.184.216.34 dst=192.168.1.10 sport=443 dport=54321 [ASSURED] mark=0 zone=0 use=2";
    const SYN_SENT_LINE: &str = "ipv4     2 tcp      6 30 SYN_SENT src=192.168.1.20 dst=8.8.8.8 sport=12345 dport=53 [UNREPLIED] src=8.8.8.8 dst=192.168.1.20 sport=53 dport=12345 mark=0 zone=0 use=2";

    #[test]
    fn test_parse_established_line() {
        let record = parse_line(ESTABLISHED_LINE).unwrap();
        assert_eq!(record.protocol, "tcp");
        assert_eq!(record.state, "ESTABLISHED");
        assert_eq!(record.timeout_seconds, 0);
    }

    #[test]
    fn test_repeated_keys_last_occurrence_wins() {
        let record = parse_line(ESTABLISHED_LINE).unwrap();
        // Reply tuple, not the original tuple
        assert_eq!(record.source_address, "93.184.216.34");
        assert_eq!(record.dest_address, "192.168.1.10");
        assert_eq!(record.source_port, "443");
        assert_eq!(record.dest_port, "54321");
    }

    #[test]
    fn test_single_tuple_line_keeps_original() {
        let line = "ipv4 2 tcp 6 30 SYN_SENT src=192.168.1.20 dst=8.8.8.8 sport=12345 dport=53 [UNREPLIED] mark=0 zone=0 use=0";
        let record = parse_line(line).unwrap();
        assert_eq!(record.protocol, "tcp");
        assert_eq!(record.state, "SYN_SENT");
        assert_eq!(record.source_address, "192.168.1.20");
        assert_eq!(record.dest_port, "53");
    }

    #[test]
    fn test_tcp_state_key_overrides_positional_state() {
        let line = "ipv4 2 tcp 6 30 SYN_SENT src=1.1.1.1 tcp_state=ESTABLISHED";
        assert_eq!(parse_line(line).unwrap().state, "ESTABLISHED");
    }

    #[test]
    fn test_timeout_key_parsed() {
        let line = "ipv4 2 tcp 6 30 TIME_WAIT src=1.1.1.1 timeout=120";
        assert_eq!(parse_line(line).unwrap().timeout_seconds, 120);
        let line = "ipv4 2 tcp 6 30 TIME_WAIT src=1.1.1.1 timeout=abc";
        assert_eq!(parse_line(line).unwrap().timeout_seconds, 0);
        let line = "ipv4 2 tcp 6 30 TIME_WAIT src=1.1.1.1 timeout=-5";
        assert_eq!(parse_line(line).unwrap().timeout_seconds, 0);
    }

    #[test]
    fn test_udp_line_uses_positional_field_as_state() {
        // UDP has no state column, position 5 is the first tuple key
        let line = "ipv4 2 udp 17 28 src=10.0.0.1 dst=10.0.0.2 sport=5353 dport=53 [UNREPLIED] src=10.0.0.2 dst=10.0.0.1 sport=53 dport=5353 mark=0 use=2";
        let record = parse_line(line).unwrap();
        assert_eq!(record.protocol, "udp");
        assert_eq!(record.state, "src=10.0.0.1");
        assert_eq!(record.dest_address, "10.0.0.1");
    }

    #[test]
    fn test_short_line_yields_empty_fields() {
        let record = parse_line("ipv4 2").unwrap();
        assert_eq!(record.protocol, "");
        assert_eq!(record.state, "");

        let record = parse_line("ipv4 2 tcp 6 30").unwrap();
        assert_eq!(record.protocol, "tcp");
        assert_eq!(record.state, "");
    }

    #[test]
    fn test_short_line_timeout_token_not_scanned() {
        let record = parse_line("ipv4 2 tcp timeout=30").unwrap();
        assert_eq!(record.timeout_seconds, 0);
        assert_eq!(record.state, "");

        let counters = count_states(&[record]);
        assert_eq!(counters.other, 1);
        assert_eq!(counters.unreplied, 0);
    }

    #[test]
    fn test_blank_line_is_skipped() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   \t ").is_none());
    }

    #[test]
    fn test_short_line_does_not_stop_table_parse() {
        let content = format!("ipv4 2\n\n{ESTABLISHED_LINE}\n{SYN_SENT_LINE}\n");
        let records = parse_table(&content);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].protocol, "");
        assert_eq!(records[1].state, "ESTABLISHED");
        assert_eq!(records[2].state, "SYN_SENT");
    }

    #[test]
    fn test_count_states() {
        let records: Vec<ConnectionRecord> =
            ["ESTABLISHED", "ESTABLISHED", "SYN_SENT", "UNREPLIED", "OTHER"]
                .iter()
                .map(|s| ConnectionRecord::with_state(s))
                .collect();
        let counters = count_states(&records);
        assert_eq!(
            counters,
            ConntrackCounters {
                total: 5,
                established: 2,
                syn_sent: 1,
                unreplied: 1,
                other: 1,
            }
        );
    }

    #[test]
    fn test_count_states_case_sensitive() {
        let records = vec![
            ConnectionRecord::with_state("established"),
            ConnectionRecord::with_state(""),
        ];
        let counters = count_states(&records);
        assert_eq!(counters.established, 0);
        assert_eq!(counters.other, 2);
    }

    #[test]
    fn test_total_equals_bucket_sum() {
        let content = format!("{ESTABLISHED_LINE}\n{SYN_SENT_LINE}\nipv4 2 tcp 6 10 TIME_WAIT\nipv4 2\n");
        let counters = count_states(&parse_table(&content));
        assert_eq!(
            counters.total,
            counters.established + counters.syn_sent + counters.unreplied + counters.other
        );
        assert_eq!(counters.total, 4);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let a = count_states(&[ConnectionRecord::with_state("ESTABLISHED")]);
        let b = count_states(&[
            ConnectionRecord::with_state("SYN_SENT"),
            ConnectionRecord::with_state("CLOSE"),
        ]);
        assert_eq!(a.merge(b), b.merge(a));
        assert_eq!(a.merge(b).total, 3);
    }

    #[test]
    fn test_read_table_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{ESTABLISHED_LINE}").unwrap();
        writeln!(file, "{SYN_SENT_LINE}").unwrap();
        let records = read_table(file.path()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_read_table_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_table(dir.path().join("nf_conntrack")).unwrap_err();
        assert!(matches!(err, ConntrackError::NotFound { .. }));
        assert!(err.to_string().contains("not found"));
    }
}
