//! Persisted copy of the registry.
//!
//! Created by the first successful save, overwritten by every later save and
//! read once at startup to seed the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tdx_common::{Result, ServerDescriptor, TdxError};

use crate::model::registry::RegistryView;

/// On-disk document: `{servers, current_index, saved_at}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Servers in priority order.
    pub servers: Vec<ServerDescriptor>,
    /// Index of the current server.
    pub current_index: Option<usize>,
    /// Time of the save, UTC.
    pub saved_at: DateTime<Utc>,
}

impl PersistedSnapshot {
    /// Snapshot of `view` stamped with the current time.
    pub fn capture(view: RegistryView) -> Self {
        Self {
            servers: view.servers,
            current_index: view.current_index,
            saved_at: Utc::now(),
        }
    }

    /// Checks the same invariants the registry enforces.
    pub fn validate(&self) -> Result<()> {
        for server in &self.servers {
            server.validate()?;
        }
        match self.current_index {
            Some(index) if index >= self.servers.len() => Err(TdxError::Validation(format!(
                "current_index {} is out of range for {} server(s)",
                index,
                self.servers.len()
            ))),
            _ => Ok(()),
        }
    }
}
