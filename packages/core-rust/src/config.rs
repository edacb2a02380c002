use std::time::Duration;

use crate::ids::IdStrategy;

/// Routing engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// How correlation handles are generated.
    pub id_strategy: IdStrategy,
    /// Age after which a pending correlation is dropped by `expire_pending`.
    /// `None` keeps correlations until resolved or until the consumer's
    /// connection closes.
    pub correlation_ttl: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_never_expire() {
        let config = EngineConfig::default();
        assert_eq!(config.id_strategy, IdStrategy::Uuid);
        assert!(config.correlation_ttl.is_none());
    }
}
