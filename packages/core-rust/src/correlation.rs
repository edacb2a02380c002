//! Pending invocation tracking keyed by generated correlation handle.
//!
//! Keyed by handle rather than by connection, so one connection may have any
//! number of invocations outstanding at once. A reverse index by consumer
//! connection makes cleanup proportional to what the connection owns.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use crate::context::ConsumerContext;
use crate::ids::{CorrelationIdSource, UuidIdSource};
use crate::types::{ConnectionId, CorrelationId};

/// Maps correlation handles to the consumer contexts waiting on them.
///
/// Like `ProviderRegistry`, this type is not synchronized; the engine's single
/// lock makes `find_and_erase` and `cleanup_by_connection` mutually exclusive,
/// which is what gives every handle exactly one terminal outcome.
pub struct CorrelationStore {
    pending: HashMap<CorrelationId, ConsumerContext>,
    by_connection: HashMap<ConnectionId, HashSet<CorrelationId>>,
    ids: Box<dyn CorrelationIdSource>,
}

impl CorrelationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_id_source(Box::new(UuidIdSource))
    }

    #[must_use]
    pub fn with_id_source(ids: Box<dyn CorrelationIdSource>) -> Self {
        Self {
            pending: HashMap::new(),
            by_connection: HashMap::new(),
            ids,
        }
    }

    /// Stores `context` under a fresh handle and returns the handle.
    pub fn create(&mut self, context: ConsumerContext) -> CorrelationId {
        let mut id = self.ids.next_id();
        while self.pending.contains_key(&id) {
            id = self.ids.next_id();
        }

        self.by_connection
            .entry(context.connection_id)
            .or_default()
            .insert(id.clone());
        self.pending.insert(id.clone(), context);
        id
    }

    /// Removes and returns the context for `id`.
    ///
    /// A handle can be consumed once; every later call returns `None`.
    pub fn find_and_erase(&mut self, id: &CorrelationId) -> Option<ConsumerContext> {
        let context = self.pending.remove(id)?;
        self.unindex(context.connection_id, id);
        Some(context)
    }

    /// Drops every context whose consumer is `connection_id`.
    ///
    /// Returns the dropped handles. Idempotent.
    pub fn cleanup_by_connection(&mut self, connection_id: ConnectionId) -> Vec<CorrelationId> {
        let Some(ids) = self.by_connection.remove(&connection_id) else {
            return Vec::new();
        };

        let mut dropped = Vec::with_capacity(ids.len());
        for id in ids {
            let removed = self.pending.remove(&id).is_some();
            debug_assert!(removed, "connection index names unknown correlation {id}");
            if removed {
                dropped.push(id);
            }
        }
        dropped
    }

    /// Drops contexts created more than `ttl` before `now`.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<(CorrelationId, ConsumerContext)> {
        let stale: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|(_, ctx)| now.saturating_duration_since(ctx.created_at) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.find_and_erase(&id).map(|ctx| (id, ctx)))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of pending contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of consumer connections with at least one pending context.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }

    /// Number of contexts pending for `connection_id`.
    #[must_use]
    pub fn pending_for(&self, connection_id: ConnectionId) -> usize {
        self.by_connection.get(&connection_id).map_or(0, HashSet::len)
    }

    fn unindex(&mut self, connection_id: ConnectionId, id: &CorrelationId) {
        if let Some(bucket) = self.by_connection.get_mut(&connection_id) {
            bucket.remove(id);
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
            for id in bucket {
                let ctx = self
                    .pending
                    .get(id)
                    .unwrap_or_else(|| panic!("index names missing correlation {id}"));
                assert_eq!(ctx.connection_id, *conn);
                indexed += 1;
            }
        }
        assert_eq!(indexed, self.pending.len());
    }
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CorrelationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationStore")
            .field("pending", &self.pending.len())
            .field("connections", &self.by_connection.len())
            .field("ids", &self.ids)
            .finish()
    }
}
