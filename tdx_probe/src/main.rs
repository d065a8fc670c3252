//! TDX probe: a diagnostic CLI that checks which upstream quote servers
//! answer. Every server is probed on its own thread (TCP connect, then the
//! setup handshake); results are collected over a channel and printed in
//! list order. Exits with an error when no server answered.
//!
//! Usage example (CLI):
//! ```bash
//! tdx_probe --servers ./servers.txt --timeout-ms 2000
//! ```
#![warn(missing_docs)]
mod args;

use crate::args::Args;
use clap::Parser;
use crossbeam_channel::{select, tick, unbounded};
use log::{info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;
use tdx_common::probe;
use tdx_common::server::{ServerListParser, default_servers};
use tdx_common::{ProbeResult, Result, ServerDescriptor, TdxError};

/// How often the collector checks for Ctrl+C while waiting.
const SHUTDOWN_POLL_MS: u64 = 100;

fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received. Printing collected results...");
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| TdxError::Format(format!("cannot set Ctrl+C handler: {}", e)))?;
    }

    let servers = match &args.servers {
        Some(raw) => {
            let path = normalize_path(raw);
            let file = File::open(&path)?;
            ServerDescriptor::parse_from_file(BufReader::new(file))?
        }
        None => default_servers(),
    };
    if servers.is_empty() {
        return Err(TdxError::Format("no servers to probe".into()));
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    info!("Probing {} server(s), {:?} each", servers.len(), timeout);
    let results = probe_all(&servers, timeout, &shutdown);

    let mut reachable = 0;
    for (server, result) in servers.iter().zip(&results) {
        match result {
            Some(r) if r.is_ok() => {
                reachable += 1;
                info!("OK      {} latency={}ms", server, r.latency_ms.unwrap_or_default());
            }
            Some(r) => warn!(
                "FAILED  {} reason={} error={}",
                server,
                r.outcome,
                r.error.as_deref().unwrap_or("-")
            ),
            None => warn!("PENDING {} (interrupted)", server),
        }
    }
    info!("{}/{} server(s) reachable", reachable, servers.len());

    if reachable == 0 {
        return Err(TdxError::Format("no server answered the handshake".into()));
    }
    Ok(())
}

/// Probes every server concurrently. Slots stay `None` for probes still
/// running when `shutdown` is raised.
fn probe_all(
    servers: &[ServerDescriptor],
    timeout: Duration,
    shutdown: &AtomicBool,
) -> Vec<Option<ProbeResult>> {
    let (result_tx, result_rx) = unbounded::<(usize, ProbeResult)>();
    for (index, server) in servers.iter().cloned().enumerate() {
        let result_tx = result_tx.clone();
        thread::spawn(move || {
            let result = probe::probe(&server, timeout);
            let _ = result_tx.send((index, result));
        });
    }
    drop(result_tx);

    let mut results = vec![None; servers.len()];
    let poll = tick(Duration::from_millis(SHUTDOWN_POLL_MS));
    loop {
        select! {
            recv(result_rx) -> msg => match msg {
                Ok((index, result)) => results[index] = Some(result),
                Err(_) => break,
            },
            recv(poll) -> _ => if shutdown.load(Ordering::Relaxed) {
                break;
            },
        }
    }
    results
}

fn init_logger() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

/// Normalize a CLI-provided path string by trimming whitespace and matching quotes.
///
/// This allows passing Windows paths in quotes without breaking parsing.
fn normalize_path(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    let no_quotes = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    PathBuf::from(no_quotes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn strips_matching_quotes() {
        assert_eq!(normalize_path("  \"C:\\servers.txt\" "), PathBuf::from("C:\\servers.txt"));
        assert_eq!(normalize_path("servers.txt"), PathBuf::from("servers.txt"));
    }

    #[test]
    fn probe_all_keeps_list_order() {
        let closed = |_: u8| {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            ServerDescriptor::new("127.0.0.1", port, None).unwrap()
        };
        let servers: Vec<_> = (0..3).map(closed).collect();
        let shutdown = AtomicBool::new(false);

        let results = probe_all(&servers, Duration::from_millis(500), &shutdown);
        assert_eq!(results.len(), 3);
        for (server, result) in servers.iter().zip(&results) {
            let result = result.as_ref().unwrap();
            assert_eq!(&result.target, server);
            assert!(!result.is_ok());
        }
    }
}
