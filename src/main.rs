//! tcpdiag — TCP connectivity health snapshot.
//!
//! Usage:
//!   tcpdiag diagnose [-i IFACE] [-d SECS] [-f markdown|json] [-o PATH] [--filter EXPR]
//!   tcpdiag interfaces
//!   tcpdiag version

use clap::Parser;
use tcpdiag::cli::{self, Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialise logging (RUST_LOG=debug etc.)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Diagnose(args) => cli::run_diagnose(&args).await,
        Commands::Interfaces => cli::run_interfaces(),
        Commands::Version => {
            println!("{}", cli::version_string());
            Ok(())
        }
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
