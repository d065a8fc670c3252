//! Command-line arguments for the probe CLI.
use clap::Parser;
use tdx_common::net::DEFAULT_PROBE_TIMEOUT_MS;

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// File with one `host:port [name]` per line. Blank lines and `#`
    /// comments are skipped. Without it the built-in server list is probed.
    #[arg(long)]
    pub servers: Option<String>,

    /// Budget for each probe, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT_MS, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_ms: u64,
}
