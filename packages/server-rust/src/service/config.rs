use capbroker_core::EngineConfig;

/// How the `context.connectionId` of inbound requests is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextBinding {
    /// Overwrite it with the id of the socket the request arrived on.
    #[default]
    Transport,
    /// Trust the caller. For gateway peers fronting many app connections,
    /// which report closures with `onConnectionClosed`.
    Declared,
}

/// Server-level configuration for the operation pipeline.
///
/// Controls operation timeouts, concurrency limits, and background task intervals.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Routing engine settings.
    pub engine: EngineConfig,
    /// Default timeout for operations in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Maximum number of concurrent operations before load shedding.
    pub max_concurrent_operations: u32,
    /// Interval between pending-correlation expiry sweeps in milliseconds.
    /// Only used when `engine.correlation_ttl` is set.
    pub expiry_sweep_interval_ms: u64,
    pub context_binding: ContextBinding,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            expiry_sweep_interval_ms: 5_000,
            context_binding: ContextBinding::Transport,
        }
    }
}
