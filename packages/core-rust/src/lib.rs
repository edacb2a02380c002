//! capbroker core: provider registry, correlation store, routing engine, and
//! the JSON-RPC message schemas shared by every transport.

pub mod config;
pub mod context;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod ids;
pub mod messages;
pub mod registry;
pub mod sink;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use context::{ConsumerContext, ProviderEntry, RequestContext, ResponseTarget};
pub use correlation::CorrelationStore;
pub use engine::{CleanupReport, EngineStats, Invocation, Registration, RoutingEngine};
pub use error::{BrokerError, DeliveryError};
pub use ids::{CorrelationIdSource, IdStrategy, SequentialIdSource, UuidIdSource};
pub use registry::{ProviderRegistry, UnregisterError};
pub use sink::ResponseSink;
pub use traits::ResponseGateway;
pub use types::{ConnectionId, CorrelationId, RequestId, ResultKind};
