//! HTTP and WebSocket handler definitions for the broker server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod health;
pub mod websocket;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use websocket::ws_upgrade_handler;

use std::sync::Arc;
use std::time::Instant;

use capbroker_core::{CleanupReport, ConnectionId, RoutingEngine};

use super::gateway::ConnectionGateway;
use super::{ConnectionRegistry, NetworkConfig, ShutdownController};
use crate::service::{
    build_operation_pipeline, BrokerService, ConnectionBindings, OperationClassifier,
    OperationPipeline, ServerConfig,
};

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Registry of all active WebSocket connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration (bind address, TLS, per-connection settings).
    pub config: Arc<NetworkConfig>,
    /// The routing engine every connection shares.
    pub engine: Arc<RoutingEngine>,
    /// Maps caller-declared connection ids to engine ids and back.
    pub bindings: Arc<ConnectionBindings>,
    /// Turns inbound JSON-RPC requests into typed operations.
    pub classifier: Arc<OperationClassifier>,
    /// Middleware-wrapped broker service.
    pub pipeline: OperationPipeline,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Wires the broker stack onto `registry`.
    ///
    /// A single `ConnectionGateway` serves as both the engine's response
    /// gateway and the broker service's provider dispatcher.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        shutdown: Arc<ShutdownController>,
        config: NetworkConfig,
        server_config: ServerConfig,
    ) -> Self {
        let bindings = Arc::new(ConnectionBindings::new(server_config.context_binding));
        let gateway = Arc::new(ConnectionGateway::new(
            Arc::clone(&registry),
            Arc::clone(&bindings),
            config.connection.send_timeout,
        ));
        let engine = Arc::new(RoutingEngine::with_gateway(
            server_config.engine.clone(),
            gateway.clone(),
        ));
        let pipeline = build_operation_pipeline(
            BrokerService::new(Arc::clone(&engine), gateway, Arc::clone(&bindings)),
            &server_config,
        );

        Self {
            registry,
            shutdown,
            config: Arc::new(config),
            engine,
            classifier: Arc::new(OperationClassifier::new(
                Arc::new(server_config),
                Arc::clone(&bindings),
            )),
            bindings,
            pipeline,
            start_time: Instant::now(),
        }
    }
}

impl AppState {
    /// Releases the broker state of everything socket `connection_id`
    /// carried: the socket itself, or every app a gateway peer declared on it.
    #[must_use]
    pub fn release_connection(&self, connection_id: ConnectionId) -> CleanupReport {
        self.bindings
            .release_peer(connection_id)
            .into_iter()
            .map(|routed| self.engine.on_connection_closed(routed))
            .fold(CleanupReport::default(), |total, report| CleanupReport {
                providers_removed: total.providers_removed + report.providers_removed,
                correlations_dropped: total.correlations_dropped + report.correlations_dropped,
            })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("connections", &self.registry.count())
            .field("health", &self.shutdown.health_state())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
