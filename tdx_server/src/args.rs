//! Command-line arguments for the gateway service.
//!
//! Every flag can also be set through the environment; `PORT` selects the
//! listening port.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tdx_common::net::{DEFAULT_HTTP_PORT, DEFAULT_PROBE_TIMEOUT_MS};

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// HTTP port to listen on (all interfaces).
    #[arg(long, env = "PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub port: u16,

    /// Directory holding the saved server snapshot; created if missing.
    #[arg(long, env = "TDX_CACHE_DIR", default_value = "cache")]
    pub cache_dir: PathBuf,

    /// Budget for one connectivity probe, in milliseconds.
    #[arg(
        long,
        env = "TDX_PROBE_TIMEOUT_MS",
        default_value_t = DEFAULT_PROBE_TIMEOUT_MS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub probe_timeout_ms: u64,
}

impl Args {
    /// Probe budget as a `Duration`.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
