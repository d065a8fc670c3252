//! Connectivity prober: a TCP connect followed by the TDX setup handshake.
//!
//! "Server unreachable" is an expected, frequent event, so probing never
//! returns an error: every failure is folded into `ProbeOutcome`. A probe
//! owns one short-lived connection and touches no shared state; callers
//! decide what to do with the `ProbeResult`.
//!
//! The whole probe (connect plus handshake) runs against a single deadline.
//! Every socket read and write re-arms its timeout to the time left, so a
//! peer that drip-feeds bytes cannot stretch a probe past its budget. Name
//! resolution runs on a helper thread and is abandoned at the deadline.
use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use log::debug;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::TdxError;
use crate::handshake;
use crate::result::Result;
use crate::server::ServerDescriptor;

/// How far a probe got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ProbeOutcome {
    /// TCP connect and handshake both succeeded.
    #[serde(rename = "ok")]
    #[strum(serialize = "ok")]
    Ok,
    /// The transport connection could not be opened in time.
    #[serde(rename = "tcp_connect_failed")]
    #[strum(serialize = "tcp_connect_failed")]
    TcpFailed,
    /// The peer accepted TCP but did not answer the setup command correctly.
    #[serde(rename = "tdx_handshake_failed")]
    #[strum(serialize = "tdx_handshake_failed")]
    HandshakeFailed,
}

/// Result of probing one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Probed server.
    pub target: ServerDescriptor,
    /// Outcome discriminant.
    pub outcome: ProbeOutcome,
    /// Handshake round-trip time, present only when `outcome` is `Ok`.
    pub latency_ms: Option<u64>,
    /// Human readable cause of a failure.
    pub error: Option<String>,
}

impl ProbeResult {
    fn ok(target: &ServerDescriptor, latency: Duration) -> Self {
        ProbeResult {
            target: target.clone(),
            outcome: ProbeOutcome::Ok,
            latency_ms: Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
            error: None,
        }
    }

    fn failed(target: &ServerDescriptor, outcome: ProbeOutcome, error: &TdxError) -> Self {
        ProbeResult {
            target: target.clone(),
            outcome,
            latency_ms: None,
            error: Some(error.to_string()),
        }
    }

    /// `true` when the server answered the handshake.
    pub fn is_ok(&self) -> bool {
        self.outcome == ProbeOutcome::Ok
    }

    /// Failure discriminant, `None` on success.
    pub fn reason(&self) -> Option<ProbeOutcome> {
        (!self.is_ok()).then_some(self.outcome)
    }
}

/// Anything able to probe a server. The service depends on this trait so a
/// scripted prober can stand in for the network.
pub trait Probe: Send + Sync {
    /// Probes `target` within `timeout`.
    fn probe(&self, target: &ServerDescriptor, timeout: Duration) -> ProbeResult;

    /// Budget used when the caller does not supply one.
    fn default_timeout(&self) -> Duration;
}

/// Network prober over `std::net::TcpStream`.
#[derive(Debug, Clone)]
pub struct TcpProber {
    default_timeout: Duration,
}

impl TcpProber {
    /// Creates a prober with the given default budget.
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Probe for TcpProber {
    fn probe(&self, target: &ServerDescriptor, timeout: Duration) -> ProbeResult {
        probe(target, timeout)
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

/// Blocking name lookup used to turn a host into socket addresses.
type Lookup = fn(&str, u16) -> io::Result<Vec<SocketAddr>>;

fn system_lookup(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    Ok((host, port).to_socket_addrs()?.collect())
}

/// Probes `target`: TCP connect, then the setup handshake, within `timeout`.
pub fn probe(target: &ServerDescriptor, timeout: Duration) -> ProbeResult {
    probe_with(target, timeout, system_lookup)
}

fn probe_with(target: &ServerDescriptor, timeout: Duration, lookup: Lookup) -> ProbeResult {
    let deadline = Instant::now() + timeout;

    let mut stream = match connect(target, deadline, lookup) {
        Ok(stream) => stream,
        Err(e) => {
            debug!("TCP connect to {} failed: {}", target.socket_addr(), e);
            return ProbeResult::failed(target, ProbeOutcome::TcpFailed, &e);
        }
    };

    let started = Instant::now();
    let result = handshake::exchange(&mut DeadlineStream {
        inner: &mut stream,
        deadline,
    });
    let _ = stream.shutdown(Shutdown::Both);

    match result {
        Ok(header) => {
            let latency = started.elapsed();
            debug!(
                "Handshake with {} succeeded in {:?} (body {} bytes)",
                target.socket_addr(),
                latency,
                header.zip_size
            );
            ProbeResult::ok(target, latency)
        }
        Err(e) => {
            debug!("Handshake with {} failed: {}", target.socket_addr(), e);
            ProbeResult::failed(target, ProbeOutcome::HandshakeFailed, &e)
        }
    }
}

/// Resolves `host` before `deadline`. IP literals skip the lookup.
fn resolve(host: &str, port: u16, deadline: Instant, lookup: Lookup) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let (addr_tx, addr_rx) = crossbeam_channel::bounded(1);
    let owned_host = host.to_string();
    thread::spawn(move || {
        let _ = addr_tx.send(lookup(&owned_host, port));
    });

    match addr_rx.recv_timeout(remaining(deadline)?) {
        Ok(addrs) => Ok(addrs?),
        Err(RecvTimeoutError::Timeout) => Err(TdxError::Io(io::Error::new(
            ErrorKind::TimedOut,
            format!("resolving {} exceeded the probe deadline", host),
        ))),
        Err(RecvTimeoutError::Disconnected) => {
            Err(TdxError::Format(format!("lookup of {} ended without a result", host)))
        }
    }
}

fn connect(target: &ServerDescriptor, deadline: Instant, lookup: Lookup) -> Result<TcpStream> {
    let addrs = resolve(&target.host, target.port, deadline, lookup)?;
    if addrs.is_empty() {
        return Err(TdxError::Format(format!("{} resolved to no address", target.host)));
    }

    let mut last_error = None;
    for addr in addrs {
        let budget = remaining(deadline)?;
        match TcpStream::connect_timeout(&addr, budget) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error
        .map(TdxError::Io)
        .unwrap_or_else(|| TdxError::Format("no address could be connected".into())))
}

fn remaining(deadline: Instant) -> io::Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|d| !d.is_zero())
        .ok_or_else(|| io::Error::new(ErrorKind::TimedOut, "probe deadline exceeded"))
}

/// Stream adapter that bounds every read and write by a shared deadline.
struct DeadlineStream<'a> {
    inner: &'a mut TcpStream,
    deadline: Instant,
}

impl Read for DeadlineStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.set_read_timeout(Some(remaining(self.deadline)?))?;
        self.inner.read(buf)
    }
}

impl Write for DeadlineStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.set_write_timeout(Some(remaining(self.deadline)?))?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
