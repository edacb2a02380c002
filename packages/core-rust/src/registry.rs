//! Capability → provider mapping with a reverse index by owning connection.
//!
//! `ProviderRegistry` holds no lock of its own. The routing engine keeps it
//! behind the same mutex as the correlation store so that connection cleanup
//! is observed atomically across both structures.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::context::ProviderEntry;
use crate::types::ConnectionId;

/// Why an unregister request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterError {
    /// The capability has no registered provider.
    NotFound,
    /// The capability is registered by a different connection.
    NotOwner { owner: ConnectionId },
}

/// Maps each capability to its single active provider.
///
/// Invariant: every `(connection, capability)` pair in `by_connection` has a
/// matching entry in `by_capability` owned by that connection, and no bucket
/// in `by_connection` is ever empty.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    by_capability: HashMap<String, ProviderEntry>,
    by_connection: HashMap<ConnectionId, HashSet<String>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `connection_id` as the provider of `capability`.
    ///
    /// Last writer wins: a previous registration is replaced and returned so the
    /// caller can log the eviction. The evicted provider is not notified.
    pub fn register(
        &mut self,
        capability: &str,
        app_id: &str,
        connection_id: ConnectionId,
    ) -> Option<ProviderEntry> {
        let entry = ProviderEntry {
            capability: capability.to_string(),
            app_id: app_id.to_string(),
            connection_id,
            registered_at: Instant::now(),
        };

        let displaced = self.by_capability.insert(capability.to_string(), entry);
        if let Some(previous) = &displaced {
            self.unindex(previous.connection_id, capability);
        }
        self.by_connection
            .entry(connection_id)
            .or_default()
            .insert(capability.to_string());
        displaced
    }

    /// Removes `capability` if and only if `connection_id` owns it.
    ///
    /// # Errors
    ///
    /// Returns `UnregisterError::NotFound` when nothing is registered and
    /// `UnregisterError::NotOwner` when another connection holds the
    /// registration. The registry is unchanged in both cases.
    pub fn unregister(
        &mut self,
        capability: &str,
        connection_id: ConnectionId,
    ) -> Result<ProviderEntry, UnregisterError> {
        let owner = match self.by_capability.get(capability) {
            None => return Err(UnregisterError::NotFound),
            Some(entry) => entry.connection_id,
        };
        if owner != connection_id {
            return Err(UnregisterError::NotOwner { owner });
        }

        let Some(removed) = self.by_capability.remove(capability) else {
            return Err(UnregisterError::NotFound);
        };
        self.unindex(connection_id, capability);
        Ok(removed)
    }

    #[must_use]
    pub fn find(&self, capability: &str) -> Option<&ProviderEntry> {
        self.by_capability.get(capability)
    }

    /// Removes every registration owned by `connection_id`.
    ///
    /// Returns the removed capabilities. Calling it again for the same
    /// connection is a no-op.
    pub fn cleanup_by_connection(&mut self, connection_id: ConnectionId) -> Vec<String> {
        let Some(capabilities) = self.by_connection.remove(&connection_id) else {
            return Vec::new();
        };

        let mut removed = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            let owned = self
                .by_capability
                .get(&capability)
                .is_some_and(|entry| entry.connection_id == connection_id);
            debug_assert!(owned, "connection index out of sync for {capability}");
            if owned {
                self.by_capability.remove(&capability);
                removed.push(capability);
            }
        }
        removed
    }

    /// Number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_capability.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_capability.is_empty()
    }

    /// Number of connections that currently own at least one registration.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }

    /// Capabilities owned by `connection_id`, sorted.
    #[must_use]
    pub fn capabilities_of(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut caps: Vec<String> = self
            .by_connection
            .get(&connection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        caps.sort();
        caps
    }

    fn unindex(&mut self, connection_id: ConnectionId, capability: &str) {
        if let Some(bucket) = self.by_connection.get_mut(&connection_id) {
            bucket.remove(capability);
            if bucket.is_empty() {
                self.by_connection.remove(&connection_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut indexed = 0;
        for (conn, bucket) in &self.by_connection {
            assert!(!bucket.is_empty(), "empty bucket left for {conn}");
            for cap in bucket {
                let entry = self
                    .by_capability
                    .get(cap)
                    .unwrap_or_else(|| panic!("index names missing capability {cap}"));
                assert_eq!(entry.connection_id, *conn);
                indexed += 1;
            }
        }
        assert_eq!(indexed, self.by_capability.len());
    }
}
