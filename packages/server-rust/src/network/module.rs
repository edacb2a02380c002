//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` wires the broker stack,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. Callers may reach the routing engine between `start()` and
//! `serve()`, for example to report the bound port before traffic arrives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use capbroker_core::{CleanupReport, RoutingEngine};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::connection::{ConnectionRegistry, OutboundMessage};
use super::handlers::{
    health_handler, liveness_handler, readiness_handler, ws_upgrade_handler, AppState,
};
use super::middleware::with_http_layers;
use super::shutdown::ShutdownController;
use crate::service::{BackgroundWorker, ExpirySweeper, ServerConfig};

/// How long `serve()` waits for in-flight operations after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages the full HTTP/WebSocket server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- allocates shared state (registry, shutdown controller, engine)
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- begins accepting connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
    expiry_sweep_interval_ms: u64,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, server_config: ServerConfig) -> Self {
        let expiry_sweep_interval_ms = server_config.expiry_sweep_interval_ms;
        let state = AppState::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(ShutdownController::new()),
            config.clone(),
            server_config,
        );
        Self {
            config,
            listener: None,
            state,
            expiry_sweep_interval_ms,
        }
    }

    /// Returns a shared reference to the connection registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.state.registry)
    }

    /// Returns a shared reference to the shutdown controller.
    ///
    /// Other modules use this to check health state or trigger shutdown.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Returns the routing engine shared by every connection.
    #[must_use]
    pub fn engine(&self) -> Arc<RoutingEngine> {
        Arc::clone(&self.state.engine)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- Kubernetes liveness check
    /// - `GET /health/ready` -- Kubernetes readiness check
    /// - `GET /ws` -- WebSocket upgrade
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone(), &self.config)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address
    /// cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Starts serving connections until the shutdown signal fires.
    ///
    /// After the shutdown signal:
    /// 1. Health state transitions to Draining
    /// 2. All connections receive a Close frame and their providers and
    ///    pending correlations are cleaned up
    /// 3. Waits up to 30 seconds for in-flight operations to complete
    /// 4. Health state transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first, if TLS material
    /// cannot be loaded, or if the server hits a fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };
        let state = self.state;
        let config = self.config;
        let interval_ms = self.expiry_sweep_interval_ms;

        let mut sweeper = state.engine.config().correlation_ttl.map(|ttl| {
            info!(
                ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
                interval_ms,
                "starting correlation expiry sweeper"
            );
            BackgroundWorker::start(ExpirySweeper::new(Arc::clone(&state.engine)), interval_ms)
        });

        let router = build_router(state.clone(), &config);

        // Transition to Ready so readiness checks pass.
        state.shutdown.set_ready();

        let served = if let Some(ref tls_config) = config.tls {
            serve_tls(listener, router, tls_config, shutdown).await
        } else {
            serve_plain(listener, router, shutdown).await
        };

        drain_connections(&state).await;
        if let Some(worker) = sweeper.as_mut() {
            worker.stop().await;
        }
        served
    }
}

fn build_router(state: AppState, config: &NetworkConfig) -> Router {
    let routes = Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/ws", get(ws_upgrade_handler));
    with_http_layers(routes, config).with_state(state)
}

/// Serves plain HTTP/WS connections using axum's built-in server.
async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("Serving plain HTTP/WS connections");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Serves TLS connections using `axum-server` with rustls.
///
/// Reuses the pre-bound TCP listener by converting it to a `std::net::TcpListener`.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls_config: &super::config::TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls_config.cert_path, &tls_config.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!("Serving TLS connections on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

/// Closes every connection, waits for in-flight operations, then releases
/// the broker state of every drained connection.
///
/// Release must follow the wait: an operation still running for a closed
/// connection could otherwise recreate state behind the cleanup.
async fn drain_connections(state: &AppState) -> CleanupReport {
    state.shutdown.trigger_shutdown();

    let handles = state.registry.drain_all();
    if !handles.is_empty() {
        info!("Draining {} connections", handles.len());
    }
    for handle in &handles {
        let _ = handle.try_send(OutboundMessage::Close(Some(
            "server shutting down".to_string(),
        )));
    }

    let drained = state.shutdown.wait_for_drain(DRAIN_TIMEOUT).await;

    let mut total = CleanupReport::default();
    for handle in &handles {
        let report = state.release_connection(handle.id);
        total.providers_removed += report.providers_removed;
        total.correlations_dropped += report.correlations_dropped;
    }

    if drained {
        info!(
            providers_removed = total.providers_removed,
            correlations_dropped = total.correlations_dropped,
            "All connections drained successfully"
        );
    } else {
        warn!("Drain timeout expired with in-flight operations remaining");
    }
    total
}

#[cfg(test)]
mod tests {
    use capbroker_core::{EngineConfig, RequestContext};

    use super::*;
    use crate::network::{ConnectionConfig, HealthState};

    fn module() -> NetworkModule {
        NetworkModule::new(NetworkConfig::default(), ServerConfig::default())
    }

    #[test]
    fn new_creates_module_without_binding() {
        assert!(module().listener.is_none());
    }

    #[test]
    fn accessors_return_shared_arcs() {
        let module = module();
        assert!(Arc::ptr_eq(&module.registry(), &module.registry()));
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
        assert!(Arc::ptr_eq(&module.engine(), &module.engine()));
    }

    #[test]
    fn build_router_creates_router() {
        let _router = module().build_router();
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module();
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let err = module()
            .serve(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn drain_releases_broker_state_of_every_connection() {
        let module = module();
        let state = module.state.clone();
        let (provider, mut provider_rx) = state.registry.register(&ConnectionConfig::default());
        let (consumer, _consumer_rx) = state.registry.register(&ConnectionConfig::default());

        state
            .engine
            .register_provider(
                &RequestContext::new(1, provider.id.0, "app1"),
                true,
                "video.play",
            )
            .unwrap();
        state
            .engine
            .invoke(&RequestContext::new(2, consumer.id.0, "app2"), "video.play")
            .unwrap();

        let report = drain_connections(&state).await;
        assert_eq!(report.providers_removed, 1);
        assert_eq!(report.correlations_dropped, 1);
        assert_eq!(state.registry.count(), 0);
        assert_eq!(state.shutdown.health_state(), HealthState::Stopped);
        assert_eq!(
            provider_rx.recv().await,
            Some(OutboundMessage::Close(Some("server shutting down".to_string())))
        );
    }

    #[tokio::test]
    async fn serve_stops_on_signal_and_runs_sweeper() {
        let server_config = ServerConfig {
            engine: EngineConfig {
                correlation_ttl: Some(Duration::from_secs(60)),
                ..EngineConfig::default()
            },
            expiry_sweep_interval_ms: 10,
            ..ServerConfig::default()
        };
        let mut module = NetworkModule::new(NetworkConfig::default(), server_config);
        module.start().await.unwrap();
        let shutdown = module.shutdown_controller();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(async {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(shutdown.health_state(), HealthState::Ready);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(shutdown.health_state(), HealthState::Stopped);
    }
}
