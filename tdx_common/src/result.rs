//! Result type alias shared across the workspace.
//!
//! This module defines a convenient alias that defaults the error type to the
//! common `TdxError`, so functions can simply return `Result<T>`.
use crate::error::TdxError;

/// Workspace-wide `Result` alias with `TdxError` as the default error.
pub type Result<T, E = TdxError> = std::result::Result<T, E>;
