//! Upstream quote server descriptors and helpers shared by the service and the CLI.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::BufRead;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TdxError;
use crate::net::{self, DEFAULT_TDX_PORT};
use crate::result::Result;

/// Longest host name accepted (DNS limit).
const MAX_HOST_LEN: usize = 253;

/// One upstream quote server: address, port and an optional display label.
///
/// Two descriptors are equal when host and port match; the label is ignored.
/// On the wire the fields are named `ip`, `port` and `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Host name or IP literal.
    #[serde(rename = "ip")]
    pub host: String,
    /// TCP port in `1..=65535`.
    pub port: u16,
    /// Human readable label.
    #[serde(rename = "name", default)]
    pub label: Option<String>,
}

impl ServerDescriptor {
    /// Builds a validated descriptor. Host and label are trimmed; an empty
    /// label becomes `None`.
    pub fn new(host: &str, port: u16, label: Option<&str>) -> Result<Self> {
        let descriptor = ServerDescriptor {
            host: host.trim().to_string(),
            port,
            label: label
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Builds a validated descriptor from an unchecked integer port, as it
    /// arrives from JSON requests.
    pub fn from_raw(host: &str, port: i64, label: Option<&str>) -> Result<Self> {
        let port = u16::try_from(port)
            .map_err(|_| TdxError::Validation(format!("port {} is outside 1..=65535", port)))?;
        Self::new(host, port, label)
    }

    /// Checks that the host is a plausible address and the port is non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TdxError::Validation("host must not be empty".into()));
        }
        if self.host.len() > MAX_HOST_LEN {
            return Err(TdxError::Validation(format!(
                "host is longer than {} characters",
                MAX_HOST_LEN
            )));
        }
        if self
            .host
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/')
        {
            return Err(TdxError::Validation(format!(
                "host '{}' contains invalid characters",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(TdxError::Validation("port 0 is outside 1..=65535".into()));
        }
        Ok(())
    }

    /// `host:port` form suitable for socket APIs.
    pub fn socket_addr(&self) -> String {
        net::addr(&self.host, self.port)
    }
}

impl PartialEq for ServerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for ServerDescriptor {}

impl Hash for ServerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} ({})", label, self.socket_addr()),
            None => f.write_str(&self.socket_addr()),
        }
    }
}

/// Parses `host:port [label...]`. IPv6 literals must be bracketed
/// (`[::1]:7709`). A missing port defaults to 7709.
impl FromStr for ServerDescriptor {
    type Err = TdxError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (endpoint, label) = match s.split_once(char::is_whitespace) {
            Some((endpoint, rest)) => (endpoint, Some(rest)),
            None => (s, None),
        };

        let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| TdxError::Validation(format!("unterminated IPv6 literal in '{}'", s)))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(TdxError::Validation(format!("malformed endpoint '{}'", endpoint))),
            }
        } else {
            match endpoint.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (endpoint, None),
            }
        };

        let port = match port {
            Some(p) => p
                .parse::<i64>()
                .map_err(|e| TdxError::Validation(format!("invalid port '{}': {}", p, e)))?,
            None => i64::from(DEFAULT_TDX_PORT),
        };
        Self::from_raw(host, port, label)
    }
}

/// Trait providing file parsing for server lists.
pub trait ServerListParser {
    /// Parses descriptors from a buffered reader.
    ///
    /// Each non-empty line that does not start with `#` is parsed with
    /// `FromStr`. Returns an error naming the line if any entry is invalid.
    fn parse_from_file<R: BufRead>(reader: R) -> Result<Vec<ServerDescriptor>>;
}

impl ServerListParser for ServerDescriptor {
    fn parse_from_file<R: BufRead>(reader: R) -> Result<Vec<Self>> {
        let mut servers = Vec::new();

        for (number, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let trimmed_line = line.trim();
            if trimmed_line.is_empty() || trimmed_line.starts_with('#') {
                continue;
            }

            match trimmed_line.parse::<Self>() {
                Ok(server) => servers.push(server),
                Err(e) => return Err(TdxError::Format(format!("line {}: {}", number + 1, e))),
            }
        }
        Ok(servers)
    }
}

/// Built-in list of public TDX quote servers, in failover priority order.
pub fn default_servers() -> Vec<ServerDescriptor> {
    [
        ("180.153.18.170", "上海电信主站Z1"),
        ("180.153.18.171", "上海电信主站Z2"),
        ("202.108.253.130", "北京联通主站Z1"),
        ("202.108.253.131", "北京联通主站Z2"),
        ("119.147.212.81", "深圳双线主站1"),
        ("60.12.136.250", "杭州电信主站"),
    ]
    .into_iter()
    .map(|(host, label)| ServerDescriptor {
        host: host.to_string(),
        port: DEFAULT_TDX_PORT,
        label: Some(label.to_string()),
    })
    .collect()
}
