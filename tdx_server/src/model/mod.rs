//! Domain models of the gateway service.
//!
//! This module groups the in-memory state owned by the selection controller:
//! - `registry`: ordered server list plus the current selection, lock guarded.
//! - `health`: per-server probe history used for diagnostics.
//! - `snapshot`: the persisted copy of the registry.

pub mod health;
pub mod registry;
pub mod snapshot;
