//! Output formatters for diagnostic results.
//!
//! Supports Markdown (human-readable report) and JSON output formats.

use std::path::{Path, PathBuf};

use crate::report::DiagnosticResult;

/// Error writing a rendered report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to write report to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Format a result as pretty-printed JSON.
pub fn format_json(result: &DiagnosticResult) -> String {
    serde_json::to_string_pretty(result)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}

/// Format a result as a Markdown report.
pub fn format_markdown(result: &DiagnosticResult) -> String {
    let mut out = String::new();
    let version = env!("CARGO_PKG_VERSION");

    out.push_str("# TCP Connectivity Diagnostic Report\n\n");
    out.push_str(&format!(
        "- **Generated:** {}\n",
        result.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str(&format!(
        "- **Interface:** {}\n",
        result.interface.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!("- **Capture duration:** {}s\n", result.duration_secs));
    out.push_str(&format!("- **Packets captured:** {}\n", result.packets_captured));
    out.push_str(&format!("- **Report ID:** {}\n\n", result.report_id));

    if !result.warnings.is_empty() {
        out.push_str("## Warnings\n\n");
        for warning in &result.warnings {
            out.push_str(&format!("> ⚠ {warning}\n"));
        }
        out.push('\n');
    }

    let tcp = &result.tcp_stats;
    out.push_str("## TCP Handshake\n\n");
    out.push_str("| Metric | Value |\n|---|---|\n");
    out.push_str(&format!("| SYN sent | {} |\n", tcp.syn_sent));
    out.push_str(&format!("| SYN-ACK received | {} |\n", tcp.syn_ack_received));
    out.push_str(&format!("| RST received | {} |\n", tcp.rst_received));
    out.push_str(&format!("| SYN-ACK ratio | {:.1}% |\n\n", tcp.syn_ack_ratio));

    let ct = &result.conntrack;
    out.push_str("## Conntrack\n\n");
    out.push_str("| State | Count |\n|---|---|\n");
    out.push_str(&format!("| Total | {} |\n", ct.total));
    out.push_str(&format!("| ESTABLISHED | {} |\n", ct.established));
    out.push_str(&format!("| SYN_SENT | {} |\n", ct.syn_sent));
    out.push_str(&format!("| UNREPLIED | {} |\n", ct.unreplied));
    out.push_str(&format!("| Other | {} |\n\n", ct.other));

    out.push_str("## Summary\n\n");
    out.push_str(&result.summary);
    out.push_str("\n\n## Recommendation\n\n");
    out.push_str(&result.recommendation);
    out.push_str(&format!("\n\n---\n_Generated by tcpdiag {version}_\n"));

    out
}

/// Write rendered output to `path`, or stdout when `path` is `None`.
pub fn write_output(rendered: &str, path: Option<&Path>) -> Result<(), ReportError> {
    match path {
        Some(path) => std::fs::write(path, rendered).map_err(|source| ReportError::Write {
            path: path.to_path_buf(),
            source,
        }),
        None => {
            print!("{rendered}");
            if !rendered.ends_with('\n') {
                println!();
            }
            Ok(())
        }
    }
}
