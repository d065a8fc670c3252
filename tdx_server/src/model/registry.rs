//! Ordered registry of upstream servers with a "current" selection.
//!
//! Order is failover priority. The `(servers, current_index)` pair lives behind
//! one `RwLock`, so readers never observe a torn state such as an index that
//! points past a list that was just shrunk. Every mutation validates its
//! input before taking the write lock and then swaps state in one step, so a
//! rejected call leaves the registry untouched.
//!
//! Invariant: `current_index` is `None` or `< servers.len()`; an empty list
//! always has `current_index == None`.

use std::sync::RwLock;

use log::info;
use serde::Serialize;
use tdx_common::{Result, ServerDescriptor, TdxError};

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryView {
    /// Servers in priority order.
    pub servers: Vec<ServerDescriptor>,
    /// Index of the current server.
    pub current_index: Option<usize>,
}

impl RegistryView {
    /// Descriptor at `current_index`, if any.
    pub fn current(&self) -> Option<&ServerDescriptor> {
        self.current_index.and_then(|i| self.servers.get(i))
    }
}

/// Lock-guarded server registry.
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryView>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only snapshot of the servers and the current index.
    pub fn list(&self) -> Result<RegistryView> {
        Ok(self.state.read()?.clone())
    }

    /// Number of registered servers.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state.read()?.servers.len())
    }

    /// Descriptor at `index`.
    pub fn get(&self, index: usize) -> Result<ServerDescriptor> {
        let state = self.state.read()?;
        state.servers.get(index).cloned().ok_or(TdxError::OutOfRange {
            index,
            len: state.servers.len(),
        })
    }

    /// Current server, if one is selected.
    pub fn current(&self) -> Result<Option<ServerDescriptor>> {
        Ok(self.state.read()?.current().cloned())
    }

    /// Replaces the whole list.
    ///
    /// Every descriptor is validated and `current_index` must fall inside the
    /// new list. Without an explicit index the first server becomes current,
    /// or none when the list is empty.
    pub fn replace_all(
        &self,
        servers: Vec<ServerDescriptor>,
        current_index: Option<usize>,
    ) -> Result<()> {
        for (i, server) in servers.iter().enumerate() {
            server.validate().map_err(|e| e.in_context(format!("server #{}", i)))?;
        }
        let current_index = match current_index {
            Some(index) if index >= servers.len() => {
                return Err(TdxError::Validation(format!(
                    "current_index {} is out of range for {} server(s)",
                    index,
                    servers.len()
                )));
            }
            Some(index) => Some(index),
            None if servers.is_empty() => None,
            None => Some(0),
        };

        let count = servers.len();
        *self.state.write()? = RegistryView {
            servers,
            current_index,
        };
        info!(
            "Registry replaced: {} server(s), current index {:?}",
            count, current_index
        );
        Ok(())
    }

    /// Marks `servers[index]` as current.
    pub fn select_current(&self, index: usize) -> Result<ServerDescriptor> {
        let mut state = self.state.write()?;
        let len = state.servers.len();
        let selected = state
            .servers
            .get(index)
            .cloned()
            .ok_or(TdxError::OutOfRange { index, len })?;
        state.current_index = Some(index);
        info!("Current server set to #{} {}", index, selected);
        Ok(selected)
    }

    /// Selects `index` only if it still holds `expected`.
    ///
    /// Used after a probe ran without the lock: if the list changed in the
    /// meantime the stale choice is dropped and `false` is returned.
    pub fn select_if_unchanged(&self, index: usize, expected: &ServerDescriptor) -> Result<bool> {
        let mut state = self.state.write()?;
        if state.servers.get(index) != Some(expected) {
            return Ok(false);
        }
        state.current_index = Some(index);
        info!("Current server set to #{} {}", index, expected);
        Ok(true)
    }

    /// Makes `descriptor` the only entry and the current one. A full replace,
    /// not a merge.
    pub fn upsert_single(&self, descriptor: ServerDescriptor) -> Result<()> {
        descriptor.validate()?;
        info!("Registry overridden with single server {}", descriptor);
        *self.state.write()? = RegistryView {
            servers: vec![descriptor],
            current_index: Some(0),
        };
        Ok(())
    }
}
