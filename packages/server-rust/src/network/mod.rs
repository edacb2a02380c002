//! Networking: configuration, connection management, the delivery gateway,
//! HTTP/WebSocket handlers, and shutdown control.

pub mod config;
pub mod connection;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use connection::*;
pub use gateway::ConnectionGateway;
pub use handlers::AppState;
pub use module::NetworkModule;
pub use shutdown::*;
