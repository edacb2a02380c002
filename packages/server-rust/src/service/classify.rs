//! Request classification: converts a JSON-RPC request into a typed `Operation`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use capbroker_core::messages::provider::methods;
use capbroker_core::messages::{
    ConnectionClosedParams, InvokeProviderParams, JsonRpcRequest, ProviderResultParams,
    RegisterProviderParams,
};
use capbroker_core::{ConnectionId, ResultKind};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::binding::ConnectionBindings;
use super::config::{ContextBinding, ServerConfig};
use super::operation::{ClassifyError, Operation, OperationContext};

const INBOUND_METHODS: [&str; 5] = [
    methods::REGISTER_PROVIDER,
    methods::INVOKE_PROVIDER,
    methods::HANDLE_PROVIDER_RESPONSE,
    methods::HANDLE_PROVIDER_ERROR,
    methods::ON_CONNECTION_CLOSED,
];

// ---------------------------------------------------------------------------
// OperationClassifier
// ---------------------------------------------------------------------------

/// Classifies incoming JSON-RPC requests into typed `Operation` variants.
///
/// Each call gets a unique call ID. Request contexts are rewritten through
/// `ConnectionBindings`, so the engine only ever sees routed ids.
pub struct OperationClassifier {
    config: Arc<ServerConfig>,
    bindings: Arc<ConnectionBindings>,
    call_id_counter: AtomicU64,
}

impl OperationClassifier {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>, bindings: Arc<ConnectionBindings>) -> Self {
        Self {
            config,
            bindings,
            call_id_counter: AtomicU64::new(1),
        }
    }

    fn next_call_id(&self) -> u64 {
        self.call_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn make_ctx(&self, connection_id: ConnectionId, method: &'static str) -> OperationContext {
        OperationContext::new(
            self.next_call_id(),
            connection_id,
            method,
            self.config.default_operation_timeout_ms,
        )
    }

    /// Classify `request`, received on `connection_id`, into an `Operation`.
    ///
    /// # Errors
    ///
    /// - `ClassifyError::UnknownMethod` for methods the broker does not serve.
    /// - `ClassifyError::NotPermitted` for `onConnectionClosed` under
    ///   transport binding, where socket closure already drives cleanup.
    /// - `ClassifyError::InvalidParams` when params do not match the method.
    /// - `ClassifyError::MissingCorrelation` for a provider result without a handle.
    /// - `ClassifyError::InvalidConnection` for a malformed closed-connection id.
    pub fn classify(
        &self,
        request: JsonRpcRequest,
        connection_id: ConnectionId,
    ) -> Result<Operation, ClassifyError> {
        let Some(method) = resolve_method(&request.method) else {
            return Err(ClassifyError::UnknownMethod {
                method: request.method,
            });
        };
        let ctx = self.make_ctx(connection_id, method);

        match method {
            methods::REGISTER_PROVIDER => {
                let mut params: RegisterProviderParams = parse_params(method, request.params)?;
                self.bindings.bind(connection_id, &mut params.context);
                Ok(Operation::RegisterProvider { ctx, params })
            }
            methods::INVOKE_PROVIDER => {
                let mut params: InvokeProviderParams = parse_params(method, request.params)?;
                self.bindings.bind(connection_id, &mut params.context);
                Ok(Operation::InvokeProvider { ctx, params })
            }
            methods::HANDLE_PROVIDER_RESPONSE | methods::HANDLE_PROVIDER_ERROR => {
                let mut params: ProviderResultParams = parse_params(method, request.params)?;
                if is_empty_payload(&params.payload) {
                    return Err(ClassifyError::EmptyPayload { method });
                }
                let correlation_id = params
                    .take_correlation()
                    .ok_or(ClassifyError::MissingCorrelation)?;
                let kind = if method == methods::HANDLE_PROVIDER_ERROR {
                    ResultKind::Error
                } else {
                    ResultKind::Success
                };
                Ok(Operation::ProviderResult {
                    ctx,
                    correlation_id,
                    payload: params.payload,
                    kind,
                })
            }
            methods::ON_CONNECTION_CLOSED => {
                if self.bindings.mode() == ContextBinding::Transport {
                    return Err(ClassifyError::NotPermitted { method });
                }
                let params: ConnectionClosedParams = parse_params(method, request.params)?;
                if params.connection().is_none() {
                    return Err(ClassifyError::InvalidConnection {
                        raw: params.connection_id,
                    });
                }
                Ok(Operation::ConnectionClosed { ctx, params })
            }
            _ => Err(ClassifyError::UnknownMethod {
                method: request.method,
            }),
        }
    }
}

/// Maps `org.rdk.ApptoAppProvider.invokeProvider` and `invokeProvider` alike
/// to the bare method constant.
fn resolve_method(raw: &str) -> Option<&'static str> {
    let bare = raw.rsplit('.').next().unwrap_or(raw);
    INBOUND_METHODS.into_iter().find(|m| *m == bare)
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

fn parse_params<T: DeserializeOwned>(
    method: &'static str,
    params: Value,
) -> Result<T, ClassifyError> {
    serde_json::from_value(params).map_err(|source| ClassifyError::InvalidParams { method, source })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
