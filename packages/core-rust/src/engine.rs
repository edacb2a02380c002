//! The routing engine: provider registration, invocation correlation, result
//! routing, and connection cleanup.
//!
//! Both maps and their connection indices live behind one `parking_lot::Mutex`.
//! Every critical section is short and synchronous. The response gateway is
//! only ever called after the lock has been released.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::{ConsumerContext, ProviderEntry, RequestContext, ResponseTarget};
use crate::correlation::CorrelationStore;
use crate::error::{BrokerError, DeliveryError};
use crate::registry::{ProviderRegistry, UnregisterError};
use crate::sink::ResponseSink;
use crate::traits::ResponseGateway;
use crate::types::{ConnectionId, CorrelationId, ResultKind};

/// Outcome of a successful `register_provider` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    Unregistered,
}

impl Registration {
    #[must_use]
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Registered)
    }
}

/// A pending invocation created by `invoke`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Handle the provider must echo back with its result.
    pub correlation_id: CorrelationId,
    /// Snapshot of the provider that served the lookup.
    pub provider: ProviderEntry,
    /// Where the eventual result will be delivered.
    pub consumer: ResponseTarget,
}

/// What `on_connection_closed` removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub providers_removed: usize,
    pub correlations_dropped: usize,
}

impl CleanupReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers_removed == 0 && self.correlations_dropped == 0
    }
}

/// Point-in-time sizes of the engine's maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub providers: usize,
    pub pending_correlations: usize,
    pub provider_connections: usize,
    pub consumer_connections: usize,
}

struct BrokerState {
    providers: ProviderRegistry,
    correlations: CorrelationStore,
}

/// Brokers capability invocations between consumers and providers.
///
/// Construct one per process and share it behind an `Arc`.
pub struct RoutingEngine {
    state: Mutex<BrokerState>,
    gateway: RwLock<Option<Arc<dyn ResponseGateway>>>,
    config: EngineConfig,
}

impl RoutingEngine {
    /// Creates an engine with no response gateway attached.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let correlations = CorrelationStore::with_id_source(config.id_strategy.build());
        Self {
            state: Mutex::new(BrokerState {
                providers: ProviderRegistry::new(),
                correlations,
            }),
            gateway: RwLock::new(None),
            config,
        }
    }

    #[must_use]
    pub fn with_gateway(config: EngineConfig, gateway: Arc<dyn ResponseGateway>) -> Self {
        let engine = Self::new(config);
        engine.attach_gateway(gateway);
        engine
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Installs (or replaces) the response gateway.
    pub fn attach_gateway(&self, gateway: Arc<dyn ResponseGateway>) {
        *self.gateway.write() = Some(gateway);
    }

    /// Removes the response gateway. Results arriving afterwards are consumed
    /// and reported as undeliverable.
    pub fn detach_gateway(&self) -> Option<Arc<dyn ResponseGateway>> {
        self.gateway.write().take()
    }

    /// Registers (`register == true`) or unregisters `capability` for the
    /// connection named in `context`.
    ///
    /// # Errors
    ///
    /// - `BadParameters` for an empty capability or app id, or a malformed
    ///   connection id.
    /// - `NotRegistered` when unregistering a capability nobody provides.
    /// - `OwnershipViolation` when unregistering another connection's capability.
    pub fn register_provider(
        &self,
        context: &RequestContext,
        register: bool,
        capability: &str,
    ) -> Result<Registration, BrokerError> {
        let connection_id = validate(context, capability)?;

        if register {
            let displaced = self
                .state
                .lock()
                .providers
                .register(capability, &context.app_id, connection_id);

            if let Some(previous) = displaced.filter(|p| p.connection_id != connection_id) {
                info!(
                    capability,
                    previous_app = %previous.app_id,
                    previous_connection = %previous.connection_id,
                    "provider displaced by newer registration"
                );
            }
            info!(
                capability,
                app_id = %context.app_id,
                connection = %connection_id,
                "registered provider"
            );
            return Ok(Registration::Registered);
        }

        let result = self
            .state
            .lock()
            .providers
            .unregister(capability, connection_id);

        match result {
            Ok(_) => {
                info!(capability, connection = %connection_id, "unregistered provider");
                Ok(Registration::Unregistered)
            }
            Err(UnregisterError::NotFound) => {
                warn!(capability, connection = %connection_id, "unregister of unknown capability");
                Err(BrokerError::NotRegistered {
                    capability: capability.to_string(),
                })
            }
            Err(UnregisterError::NotOwner { owner }) => {
                warn!(
                    capability,
                    owner = %owner,
                    requester = %connection_id,
                    "unregister ownership violation"
                );
                Err(BrokerError::OwnershipViolation {
                    capability: capability.to_string(),
                    owner,
                    requester: connection_id,
                })
            }
        }
    }

    /// Current provider for `capability`, if any.
    #[must_use]
    pub fn find_provider(&self, capability: &str) -> Option<ProviderEntry> {
        self.state.lock().providers.find(capability).cloned()
    }

    /// Creates a pending correlation for `context` against `capability`.
    ///
    /// The correlation is resolvable as soon as this returns, before any
    /// request has been dispatched to the provider.
    ///
    /// # Errors
    ///
    /// - `BadParameters` for malformed input.
    /// - `UnknownCapability` if no provider is registered. No correlation is
    ///   created and nothing is queued.
    pub fn invoke(
        &self,
        context: &RequestContext,
        capability: &str,
    ) -> Result<Invocation, BrokerError> {
        let connection_id = validate(context, capability)?;

        let created = {
            let mut state = self.state.lock();
            match state.providers.find(capability).cloned() {
                None => None,
                Some(provider) => {
                    let consumer = ConsumerContext {
                        request_id: context.request_id,
                        connection_id,
                        app_id: context.app_id.clone(),
                        capability: capability.to_string(),
                        created_at: Instant::now(),
                    };
                    let target = consumer.target();
                    let correlation_id = state.correlations.create(consumer);
                    Some((
                        Invocation {
                            correlation_id,
                            provider,
                            consumer: target,
                        },
                        state.correlations.len(),
                    ))
                }
            }
        };

        let Some((invocation, pending)) = created else {
            warn!(capability, consumer = %connection_id, "invoke: no provider for capability");
            counter!("capbroker_invocations_total", "outcome" => "unknown_capability").increment(1);
            return Err(BrokerError::UnknownCapability {
                capability: capability.to_string(),
            });
        };

        counter!("capbroker_invocations_total", "outcome" => "pending").increment(1);
        record_pending(pending);
        debug!(
            capability,
            correlation = %invocation.correlation_id,
            consumer = %connection_id,
            request_id = %context.request_id,
            provider = %invocation.provider.connection_id,
            "invocation pending"
        );
        Ok(invocation)
    }

    /// Routes a provider result (or error) to the consumer that asked for it.
    ///
    /// The correlation is consumed before delivery is attempted and is never
    /// restored, so a retried provider callback cannot deliver twice.
    ///
    /// # Errors
    ///
    /// - `BadParameters` for an empty handle.
    /// - `UnknownCorrelation` if the handle was already resolved, dropped by
    ///   connection cleanup or expiry, or never existed.
    /// - `Delivery` if no gateway is attached or the gateway fails.
    pub async fn handle_result(
        &self,
        correlation_id: &CorrelationId,
        payload: Value,
        kind: ResultKind,
    ) -> Result<(), BrokerError> {
        if correlation_id.is_empty() {
            return Err(BrokerError::bad_parameters(
                "correlationId must be a non-empty string",
            ));
        }

        let (context, gateway, pending) = {
            let mut state = self.state.lock();
            let context = state.correlations.find_and_erase(correlation_id);
            // Take the gateway handle while still locked so it stays alive
            // across the unlocked delivery call.
            let gateway = self.gateway.read().clone();
            (context, gateway, state.correlations.len())
        };

        let Some(context) = context else {
            warn!(correlation = %correlation_id, kind = kind.as_str(), "result for unknown correlation");
            counter!("capbroker_results_total", "outcome" => "unknown_correlation").increment(1);
            return Err(BrokerError::UnknownCorrelation {
                correlation_id: correlation_id.clone(),
            });
        };
        record_pending(pending);

        let Some(gateway) = gateway else {
            warn!(
                correlation = %correlation_id,
                consumer = %context.connection_id,
                "no response gateway attached; result dropped"
            );
            counter!("capbroker_results_total", "outcome" => "undeliverable").increment(1);
            return Err(DeliveryError::GatewayUnavailable.into());
        };

        let target = context.target();
        match gateway.respond(&target, payload, kind).await {
            Ok(()) => {
                counter!("capbroker_results_total", "outcome" => "delivered").increment(1);
                debug!(
                    correlation = %correlation_id,
                    capability = %context.capability,
                    consumer = %target.connection_id,
                    request_id = %target.request_id,
                    kind = kind.as_str(),
                    "result delivered"
                );
                Ok(())
            }
            Err(err) => {
                counter!("capbroker_results_total", "outcome" => "undeliverable").increment(1);
                warn!(
                    correlation = %correlation_id,
                    consumer = %target.connection_id,
                    error = %err,
                    "result delivery failed"
                );
                Err(err.into())
            }
        }
    }

    /// Drops a pending correlation without delivering anything.
    ///
    /// Used by transports when the request could not be dispatched to the
    /// provider after `invoke` succeeded.
    pub fn withdraw(&self, correlation_id: &CorrelationId) -> Option<ConsumerContext> {
        let (context, pending) = {
            let mut state = self.state.lock();
            let context = state.correlations.find_and_erase(correlation_id);
            (context, state.correlations.len())
        };
        if context.is_some() {
            record_pending(pending);
            debug!(correlation = %correlation_id, "correlation withdrawn");
        }
        context
    }

    /// Removes every registration and pending correlation owned by
    /// `connection_id`. Safe to call repeatedly.
    pub fn on_connection_closed(&self, connection_id: ConnectionId) -> CleanupReport {
        let (capabilities, dropped, pending) = {
            let mut state = self.state.lock();
            let capabilities = state.providers.cleanup_by_connection(connection_id);
            let dropped = state.correlations.cleanup_by_connection(connection_id);
            (capabilities, dropped, state.correlations.len())
        };

        let report = CleanupReport {
            providers_removed: capabilities.len(),
            correlations_dropped: dropped.len(),
        };
        if !report.is_empty() {
            record_pending(pending);
            info!(
                connection = %connection_id,
                providers_removed = report.providers_removed,
                correlations_dropped = report.correlations_dropped,
                "cleaned up closed connection"
            );
            for capability in &capabilities {
                debug!(connection = %connection_id, capability = %capability, "provider removed");
            }
        }
        report
    }

    /// Drops correlations older than the configured TTL. Returns how many were
    /// dropped; always zero when no TTL is configured.
    pub fn expire_pending(&self, now: Instant) -> usize {
        let Some(ttl) = self.config.correlation_ttl else {
            return 0;
        };

        let (expired, pending) = {
            let mut state = self.state.lock();
            let expired = state.correlations.expire(now, ttl);
            (expired, state.correlations.len())
        };

        if !expired.is_empty() {
            record_pending(pending);
            counter!("capbroker_results_total", "outcome" => "expired")
                .increment(expired.len() as u64);
        }
        for (id, context) in &expired {
            warn!(
                correlation = %id,
                capability = %context.capability,
                consumer = %context.connection_id,
                "pending correlation expired"
            );
        }
        expired.len()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let state = self.state.lock();
        EngineStats {
            providers: state.providers.len(),
            pending_correlations: state.correlations.len(),
            provider_connections: state.providers.connection_count(),
            consumer_connections: state.correlations.connection_count(),
        }
    }

    /// A callback object bound to `correlation_id` for provider-side transports.
    #[must_use]
    pub fn response_sink(self: &Arc<Self>, correlation_id: CorrelationId) -> ResponseSink {
        ResponseSink::new(Arc::clone(self), correlation_id)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let state = self.state.lock();
        state.providers.assert_consistent();
        state.correlations.assert_consistent();
    }
}

impl fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("stats", &self.stats())
            .field("gateway_attached", &self.gateway.read().is_some())
            .field("config", &self.config)
            .finish()
    }
}

fn validate(context: &RequestContext, capability: &str) -> Result<ConnectionId, BrokerError> {
    if capability.trim().is_empty() {
        return Err(BrokerError::bad_parameters(
            "capability must be a non-empty string",
        ));
    }
    if context.app_id.trim().is_empty() {
        return Err(BrokerError::bad_parameters(
            "appId must be a non-empty string",
        ));
    }
    context.connection().ok_or_else(|| {
        BrokerError::bad_parameters(format!(
            "invalid connectionId \"{}\"",
            context.connection_id
        ))
    })
}

#[allow(clippy::cast_precision_loss)]
fn record_pending(pending: usize) {
    gauge!("capbroker_pending_correlations").set(pending as f64);
}
