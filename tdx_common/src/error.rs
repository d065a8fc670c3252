//! Error types shared between the service and the diagnostic CLI.
//!
//! The `TdxError` enum unifies the failure cases of descriptor validation,
//! registry access, persistence I/O and serialization, allowing crates to
//! propagate a single error type. Connectivity failures are NOT errors: the
//! prober encodes them in `ProbeOutcome`.
use std::fmt::Display;
use std::io;
use std::sync::PoisonError;

use thiserror::Error;

/// Unified error type shared by the service and the CLI.
#[derive(Error, Debug)]
pub enum TdxError {
    /// I/O error originating from the standard library or sockets/files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failure while encoding/decoding JSON via serde_json.
    #[error("JSON serialization/deserialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// A server descriptor or a registry argument was rejected.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A registry index does not point at an existing entry.
    #[error("Index {index} is out of range for {len} server(s)")]
    OutOfRange {
        /// Requested index.
        index: usize,
        /// Registry length at the time of the request.
        len: usize,
    },

    /// No current server is selected.
    #[error("No current server is configured")]
    NotConfigured,

    /// Error indicating a poisoned mutex/lock was encountered.
    #[error("Mutex Lock Poisoned: {0}")]
    MutexLock(String),

    /// A blocking task panicked or was cancelled before producing a value.
    #[error("Background task failed: {0}")]
    Task(String),

    /// Generic formatting error with a human-readable message.
    #[error("Format error: {0}")]
    Format(String),
}

impl TdxError {
    /// Returns `true` when the error is caused by client input rather than
    /// by the service itself.
    pub fn is_client_error(&self) -> bool {
        matches!(self, TdxError::Validation(_) | TdxError::OutOfRange { .. })
    }

    /// Prefixes a validation message with `context`, keeping a single
    /// "Validation error" tag. Other errors pass through unchanged.
    pub fn in_context(self, context: impl Display) -> Self {
        match self {
            TdxError::Validation(msg) => TdxError::Validation(format!("{}: {}", context, msg)),
            other => other,
        }
    }
}

impl<T> From<PoisonError<T>> for TdxError {
    fn from(err: PoisonError<T>) -> Self {
        TdxError::MutexLock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_a_single_validation_tag() {
        let err = TdxError::Validation("port out of range".into()).in_context("server #1");
        let msg = err.to_string();
        assert_eq!(msg, "Validation error: server #1: port out of range");
        assert_eq!(msg.matches("Validation error").count(), 1);
    }

    #[test]
    fn context_leaves_other_errors_alone() {
        let err = TdxError::NotConfigured.in_context("server #1");
        assert!(matches!(err, TdxError::NotConfigured));
        assert!(!err.is_client_error());
        assert!(TdxError::OutOfRange { index: 3, len: 1 }.is_client_error());
    }
}
