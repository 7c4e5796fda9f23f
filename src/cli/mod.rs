//! CLI entrypoint for tcpdiag.
//!
//! Parses arguments, merges them over the `TCPDIAG_*` environment
//! configuration, runs the diagnostic and writes the report.

pub mod output;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::capture::list_interfaces;
use crate::engine::{run_diagnosis, DiagnoseConfig};

pub use output::{format_json, format_markdown, write_output, ReportError};

// ─────────────────────────────────────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────────────────────────────────────

/// tcpdiag — TCP connectivity health snapshot.
#[derive(Parser, Debug)]
#[command(name = "tcpdiag", version, about)]
#[command(
    long_about = "tcpdiag captures packets on an interface, counts TCP handshake \
    signals (SYN, SYN-ACK, RST), reads the kernel conntrack table, and writes a \
    diagnostic report as JSON or Markdown. Live capture requires CAP_NET_RAW (sudo)."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture, analyse handshakes, read conntrack and write a report
    Diagnose(DiagnoseArgs),
    /// List network interfaces available for capture
    Interfaces,
    /// Show version information
    Version,
}

/// Arguments for the `diagnose` subcommand.
#[derive(Args, Debug)]
pub struct DiagnoseArgs {
    /// Network interface to capture on (default: TCPDIAG_INTERFACE or the default-route interface)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Capture duration in seconds (default: TCPDIAG_DURATION_SECS or 30)
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    pub duration: Option<u64>,

    /// Output format
    #[arg(short, long, default_value = "markdown", value_enum)]
    pub format: OutputFmt,

    /// Output file path (stdout if omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Capture filter, e.g. "tcp port 443" or "host 10.0.0.1 and tcp"
    #[arg(long)]
    pub filter: Option<String>,

    /// Conntrack table path
    #[arg(long)]
    pub conntrack_path: Option<PathBuf>,
}

/// Output format argument.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFmt {
    Markdown,
    Json,
}

impl DiagnoseArgs {
    /// Apply CLI flags over a base configuration.
    pub fn apply_to(&self, mut config: DiagnoseConfig) -> DiagnoseConfig {
        if let Some(iface) = &self.interface {
            config.interface = Some(iface.clone());
        }
        if let Some(secs) = self.duration {
            config.duration = Duration::from_secs(secs);
        }
        if let Some(filter) = &self.filter {
            config.filter = filter.clone();
        }
        if let Some(path) = &self.conntrack_path {
            config.conntrack_path = path.clone();
        }
        config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Run the `diagnose` subcommand.
pub async fn run_diagnose(args: &DiagnoseArgs) -> Result<(), String> {
    let config = args.apply_to(DiagnoseConfig::from_env());

    eprintln!(
        "Capturing on {} for {} seconds...",
        config.interface.as_deref().unwrap_or("default interface"),
        config.duration.as_secs()
    );

    let result = run_diagnosis(&config)
        .await
        .map_err(|e| format!("invalid --filter: {e}"))?;

    for warning in &result.warnings {
        eprintln!("Warning: {warning}");
    }

    let rendered = match args.format {
        OutputFmt::Markdown => format_markdown(&result),
        OutputFmt::Json => format_json(&result),
    };
    write_output(&rendered, args.output.as_deref()).map_err(|e| e.to_string())?;

    if let Some(path) = &args.output {
        eprintln!("Report written to {}", path.display());
    }
    Ok(())
}

/// Run the `interfaces` subcommand.
pub fn run_interfaces() -> Result<(), String> {
    let ifaces = list_interfaces().map_err(|e| format!("failed to list interfaces: {e}"))?;
    for iface in ifaces {
        println!("{iface}");
    }
    Ok(())
}

/// Version line printed by the `version` subcommand.
pub fn version_string() -> String {
    format!("tcpdiag {}", env!("CARGO_PKG_VERSION"))
}
