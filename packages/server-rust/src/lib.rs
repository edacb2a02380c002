//! capbroker server: WebSocket transport and operation pipeline around the
//! `capbroker-core` routing engine.

pub mod network;
pub mod service;
pub mod traits;

pub use network::{ConnectionGateway, NetworkConfig, NetworkModule};
pub use service::{ContextBinding, ServerConfig};
pub use traits::{DispatchError, ProviderDispatcher};
