//! Shared networking constants and helpers used by the service and the CLI.

/// Default HTTP listening port of the service.
pub const DEFAULT_HTTP_PORT: u16 = 6999;
/// Port most public TDX quote servers listen on.
pub const DEFAULT_TDX_PORT: u16 = 7709;
/// Default budget for a single connectivity probe, in milliseconds.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

/// Helper to format a host and port like "ip:port", bracketing IPv6 literals.
pub fn addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
