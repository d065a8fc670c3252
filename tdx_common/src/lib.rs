//!
//! Common types and utilities shared by the TDX gateway service and the probe CLI.
//!
//! This crate aggregates:
//! - `error`: unified error type `TdxError` used across the workspace.
//! - `result`: handy `Result<T, TdxError>` alias.
//! - `server`: upstream server descriptors, parsing and the built-in defaults.
//! - `handshake`: the TDX setup exchange used to recognise a quote server.
//! - `probe`: TCP plus handshake connectivity prober.
//! - `net`: networking constants and small helpers.
#![warn(missing_docs)]
pub mod error;
pub mod handshake;
pub mod net;
pub mod probe;
pub mod result;
pub mod server;

pub use error::TdxError;
pub use probe::{Probe, ProbeOutcome, ProbeResult, TcpProber};
pub use result::Result;
pub use server::ServerDescriptor;
