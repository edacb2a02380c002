//! Correlation handle generation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::types::CorrelationId;

/// Source of fresh correlation handles, injected into the engine.
///
/// Handles only need to be unique for the lifetime of the process.
pub trait CorrelationIdSource: Send + Sync + fmt::Debug {
    fn next_id(&self) -> CorrelationId;
}

/// Random UUID v4 handles.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdSource;

impl CorrelationIdSource for UuidIdSource {
    fn next_id(&self) -> CorrelationId {
        CorrelationId::new(Uuid::new_v4().to_string())
    }
}

/// Monotonic `<start-millis>-<counter>` handles, both in hex.
///
/// The start stamp keeps handles from two process lifetimes apart; the
/// counter keeps them ordered within one.
#[derive(Debug)]
pub struct SequentialIdSource {
    epoch_ms: u64,
    counter: AtomicU64,
}

impl SequentialIdSource {
    #[must_use]
    pub fn new() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self::with_epoch(epoch_ms)
    }

    #[must_use]
    pub fn with_epoch(epoch_ms: u64) -> Self {
        Self {
            epoch_ms,
            counter: AtomicU64::new(1),
        }
    }
}

impl Default for SequentialIdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIdSource for SequentialIdSource {
    fn next_id(&self) -> CorrelationId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        CorrelationId::new(format!("{:x}-{n:012x}", self.epoch_ms))
    }
}

/// Which handle generator the engine should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    #[default]
    Uuid,
    Sequential,
}

impl IdStrategy {
    #[must_use]
    pub fn build(self) -> Box<dyn CorrelationIdSource> {
        match self {
            Self::Uuid => Box::new(UuidIdSource),
            Self::Sequential => Box::new(SequentialIdSource::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn uuid_source_produces_distinct_handles() {
        let source = UuidIdSource;
        let ids: HashSet<_> = (0..1000).map(|_| source.next_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn uuid_handles_are_v4_shaped() {
        let id = UuidIdSource.next_id();
        let parsed = Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn sequential_source_is_monotonic() {
        let source = SequentialIdSource::with_epoch(0x18c0);
        let a = source.next_id();
        let b = source.next_id();
        assert_eq!(a.as_str(), "18c0-000000000001");
        assert_eq!(b.as_str(), "18c0-000000000002");
        assert!(a < b);
    }

    #[test]
    fn strategy_builds_matching_source() {
        let seq = IdStrategy::Sequential.build().next_id();
        assert!(seq.as_str().contains('-'));
        let uuid = IdStrategy::Uuid.build().next_id();
        assert!(Uuid::parse_str(uuid.as_str()).is_ok());
    }
}
