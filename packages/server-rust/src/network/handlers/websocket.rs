//! WebSocket session handling.
//!
//! Every upgraded socket is registered with the `ConnectionRegistry`, so the
//! routing engine addresses it by the same `ConnectionId` the registry hands
//! out. Inbound frames are JSON-RPC requests; each one runs on its own task
//! through the operation pipeline and replies through the connection's
//! outbound channel, so a slow invocation never blocks the read loop.
//! Those tasks belong to the session: its broker state is released only after
//! every one of them has finished.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use capbroker_core::messages::rpc::codes;
use capbroker_core::messages::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use capbroker_core::{CleanupReport, ConnectionId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tower::ServiceExt;
use tracing::{debug, info, warn};

use super::AppState;
use crate::network::connection::{ConnectionHandle, OutboundMessage};

/// Upgrades an HTTP connection to a broker WebSocket session.
///
/// Returns 503 unless the server is Ready, so no session starts while the
/// server is still starting or already draining.
pub async fn ws_upgrade_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if !state.shutdown.health_state().is_accepting() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let max_message_size = state.config.connection.ws_max_message_size;
    let write_buffer_size = state.config.connection.ws_write_buffer_size;
    let max_write_buffer_size = state.config.connection.ws_max_write_buffer_size;

    ws.max_message_size(max_message_size)
        .write_buffer_size(write_buffer_size)
        .max_write_buffer_size(max_write_buffer_size)
        .on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(mut socket: WebSocket, state: AppState) {
    let (handle, mut outbound) = state.registry.register(&state.config.connection);
    let connection_id = handle.id;
    let idle_timeout = state.config.connection.idle_timeout;
    let mut idle_deadline = Instant::now() + idle_timeout;
    let mut shutdown = state.shutdown.shutdown_receiver();
    let mut requests = JoinSet::new();

    info!(connection = %connection_id, "websocket session opened");

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    idle_deadline = Instant::now() + idle_timeout;
                    spawn_request(&mut requests, &state, &handle, text.to_string());
                }
                Some(Ok(Message::Binary(bytes))) => {
                    idle_deadline = Instant::now() + idle_timeout;
                    match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => spawn_request(&mut requests, &state, &handle, text),
                        Err(_) => {
                            let reply = parse_error("binary frame is not valid UTF-8");
                            if let Some(text) = encode_reply(&reply) {
                                if socket.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    idle_deadline = Instant::now() + idle_timeout;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(connection = %connection_id, error = %err, "websocket read failed");
                    break;
                }
            },
            message = outbound.recv() => match message {
                Some(OutboundMessage::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(OutboundMessage::Close(reason)) => {
                    let frame = close_frame(close_code::AWAY, reason.unwrap_or_default());
                    let _ = socket.send(frame).await;
                    break;
                }
                None => break,
            },
            _ = shutdown.changed() => {
                let _ = socket
                    .send(close_frame(close_code::AWAY, "server shutting down".to_string()))
                    .await;
                break;
            }
            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(err) = joined {
                    warn!(connection = %connection_id, error = %err, "request task failed");
                }
            }
            () = sleep_until(idle_deadline) => {
                info!(connection = %connection_id, "closing idle websocket session");
                let _ = socket
                    .send(close_frame(close_code::NORMAL, "idle timeout".to_string()))
                    .await;
                break;
            }
        }
    }

    let report = close_session(&state, connection_id, outbound, requests).await;
    info!(
        connection = %connection_id,
        providers_removed = report.providers_removed,
        correlations_dropped = report.correlations_dropped,
        session_secs = handle.age().as_secs(),
        "websocket session closed"
    );
}

/// Tears a session down once its socket loop has ended.
///
/// The session leaves the registry first, so nothing new is routed to it, and
/// its outbound queue is closed so pending replies fail fast. Requests it
/// already submitted then run to completion before the broker state of the
/// connection is released, so none of them can leave a registration or
/// pending invocation behind.
async fn close_session(
    state: &AppState,
    connection_id: ConnectionId,
    outbound: mpsc::Receiver<OutboundMessage>,
    mut requests: JoinSet<()>,
) -> CleanupReport {
    state.registry.remove(connection_id);
    drop(outbound);
    while let Some(joined) = requests.join_next().await {
        if let Err(err) = joined {
            warn!(connection = %connection_id, error = %err, "request task failed");
        }
    }
    state.release_connection(connection_id)
}

fn spawn_request(
    requests: &mut JoinSet<()>,
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    frame: String,
) {
    let state = state.clone();
    let handle = Arc::clone(handle);

    requests.spawn(async move {
        let _guard = state.shutdown.in_flight_guard();
        let Some(reply) = process_frame(&state, handle.id, &frame).await else {
            return;
        };
        let Some(text) = encode_reply(&reply) else {
            return;
        };
        if let Err(err) = handle
            .send_timeout(OutboundMessage::Text(text), state.config.connection.send_timeout)
            .await
        {
            debug!(connection = %handle.id, error = %err, "reply dropped");
        }
    });
}

/// Runs one inbound frame through classification and the operation pipeline.
///
/// Returns `None` for notifications, which never get a reply.
pub(crate) async fn process_frame(
    state: &AppState,
    connection_id: ConnectionId,
    frame: &str,
) -> Option<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_str(frame) {
        Ok(request) => request,
        Err(err) => {
            debug!(connection = %connection_id, error = %err, "unparseable frame");
            return Some(parse_error(&err.to_string()));
        }
    };

    let id = request.id.clone();
    let outcome = match state.classifier.classify(request, connection_id) {
        Ok(op) => state
            .pipeline
            .clone()
            .oneshot(op)
            .await
            .map(|response| response.to_result())
            .map_err(|err| err.to_rpc_error()),
        Err(err) => {
            debug!(connection = %connection_id, error = %err, "request rejected");
            Err(err.to_rpc_error())
        }
    };

    let id = id?;
    Some(match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => JsonRpcResponse::failure(id, error),
    })
}

fn parse_error(message: &str) -> JsonRpcResponse {
    JsonRpcResponse::failure(Value::Null, JsonRpcError::new(codes::PARSE_ERROR, message))
}

fn encode_reply(reply: &JsonRpcResponse) -> Option<String> {
    serde_json::to_string(reply)
        .map_err(|err| warn!(error = %err, "failed to encode reply"))
        .ok()
}

fn close_frame(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use capbroker_core::messages::provider::methods;
    use serde_json::json;

    use super::*;
    use crate::network::{ConnectionConfig, ConnectionRegistry, NetworkConfig, ShutdownController};
    use crate::service::{ContextBinding, ServerConfig};

    fn test_state() -> AppState {
        state_with(ContextBinding::Transport)
    }

    fn state_with(context_binding: ContextBinding) -> AppState {
        AppState::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(ShutdownController::new()),
            NetworkConfig::default(),
            ServerConfig {
                context_binding,
                ..ServerConfig::default()
            },
        )
    }

    fn register_frame(id: u64, conn: u32, register: bool) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "registerProvider",
            "params": {
                "context": {"requestId": id, "connectionId": conn, "appId": "app1"},
                "register": register,
                "capability": "video.play"
            }
        })
    }

    fn connect(state: &AppState) -> (ConnectionId, mpsc::Receiver<OutboundMessage>) {
        let (handle, rx) = state.registry.register(&ConnectionConfig::default());
        (handle.id, rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<OutboundMessage>) -> Value {
        match rx.recv().await {
            Some(OutboundMessage::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn call(state: &AppState, conn: ConnectionId, frame: Value) -> JsonRpcResponse {
        process_frame(state, conn, &frame.to_string())
            .await
            .expect("call should be answered")
    }

    #[tokio::test]
    async fn garbage_frame_is_parse_error() {
        let state = test_state();
        let reply = process_frame(&state, ConnectionId(1), "{not json")
            .await
            .unwrap();
        assert_eq!(reply.id, Value::Null);
        assert_eq!(reply.error.unwrap().code, codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let state = test_state();
        let reply = call(
            &state,
            ConnectionId(1),
            json!({"jsonrpc": "2.0", "id": 4, "method": "reboot", "params": {}}),
        )
        .await;
        assert_eq!(reply.id, json!(4));
        assert_eq!(reply.error.unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notification_gets_no_reply() {
        let state = test_state();
        let reply = process_frame(
            &state,
            ConnectionId(1),
            &json!({"jsonrpc": "2.0", "method": "reboot"}).to_string(),
        )
        .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn invoke_without_provider_is_provider_not_found() {
        let state = test_state();
        let (consumer, _rx) = connect(&state);
        let reply = call(
            &state,
            consumer,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "invokeProvider",
                "params": {
                    "context": {"requestId": 1, "connectionId": consumer.0, "appId": "app2"},
                    "capability": "video.play"
                }
            }),
        )
        .await;
        assert_eq!(reply.error.unwrap().code, codes::PROVIDER_NOT_FOUND);
    }

    #[tokio::test]
    async fn full_round_trip_between_two_connections() {
        let state = test_state();
        let (provider, mut provider_rx) = connect(&state);
        let (consumer, mut consumer_rx) = connect(&state);

        let reply = call(
            &state,
            provider,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "org.rdk.ApptoAppProvider.registerProvider",
                "params": {
                    "context": {"requestId": 1, "connectionId": provider.0, "appId": "app1"},
                    "register": true,
                    "capability": "video.play"
                }
            }),
        )
        .await;
        assert_eq!(reply.result, Some(json!({"registered": true})));

        let reply = call(
            &state,
            consumer,
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "invokeProvider",
                "params": {
                    "context": {"requestId": 42, "connectionId": consumer.0, "appId": "app2"},
                    "capability": "video.play",
                    "payload": {"title": "x"}
                }
            }),
        )
        .await;
        let correlation_id = reply.result.unwrap()["correlationId"].clone();
        assert!(correlation_id.is_string());

        let request = next_frame(&mut provider_rx).await;
        assert_eq!(request["method"], methods::PROVIDER_REQUEST);
        assert_eq!(request["params"]["correlationId"], correlation_id);
        assert_eq!(request["params"]["payload"]["title"], "x");

        let reply = call(
            &state,
            provider,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "handleProviderResponse",
                "params": {
                    "payload": {"correlationId": correlation_id, "result": "playing"},
                    "capability": "video.play"
                }
            }),
        )
        .await;
        assert_eq!(reply.result, Some(json!({"delivered": true})));

        let respond = next_frame(&mut consumer_rx).await;
        assert_eq!(respond["method"], methods::GATEWAY_RESPOND);
        assert_eq!(respond["params"]["context"]["requestId"], 42);
        assert_eq!(respond["params"]["context"]["connectionId"], consumer.0);
        assert_eq!(respond["params"]["payload"], json!({"result": "playing"}));

        // The handle is spent.
        let reply = call(
            &state,
            provider,
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "handleProviderError",
                "params": {"payload": {"correlationId": correlation_id}}
            }),
        )
        .await;
        assert_eq!(reply.error.unwrap().code, codes::UNKNOWN_CORRELATION);
        assert_eq!(state.engine.stats().pending_correlations, 0);
    }

    #[tokio::test]
    async fn invoke_to_vanished_provider_is_dispatch_failure() {
        let state = test_state();
        let (provider, provider_rx) = connect(&state);
        let (consumer, _consumer_rx) = connect(&state);

        call(
            &state,
            provider,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "registerProvider",
                "params": {
                    "context": {"requestId": 1, "connectionId": provider.0, "appId": "app1"},
                    "register": true,
                    "capability": "video.play"
                }
            }),
        )
        .await;
        drop(provider_rx);

        let reply = call(
            &state,
            consumer,
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "invokeProvider",
                "params": {
                    "context": {"requestId": 2, "connectionId": consumer.0, "appId": "app2"},
                    "capability": "video.play"
                }
            }),
        )
        .await;
        assert_eq!(reply.error.unwrap().code, codes::DISPATCH_FAILED);
        assert_eq!(state.engine.stats().pending_correlations, 0);
    }

    #[tokio::test]
    async fn connection_closed_is_refused_under_transport_binding() {
        let state = test_state();
        let reply = call(
            &state,
            ConnectionId(1),
            json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "onConnectionClosed",
                "params": {"connectionId": 5}
            }),
        )
        .await;
        assert_eq!(reply.error.unwrap().code, codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unregister_errors_tell_missing_from_foreign() {
        let state = test_state();
        let (owner, _owner_rx) = connect(&state);
        let (other, _other_rx) = connect(&state);

        let reply = call(&state, owner, register_frame(1, owner.0, false)).await;
        assert_eq!(reply.error.unwrap().code, codes::PROVIDER_NOT_FOUND);

        call(&state, owner, register_frame(2, owner.0, true)).await;
        let reply = call(&state, other, register_frame(3, other.0, false)).await;
        assert_eq!(reply.error.unwrap().code, codes::INVALID_REQUEST);
        assert!(state.engine.find_provider("video.play").is_some());
    }

    #[tokio::test]
    async fn empty_provider_result_is_invalid_params() {
        let state = test_state();
        let reply = call(
            &state,
            ConnectionId(1),
            json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "handleProviderResponse",
                "params": {"correlationId": "h1", "payload": null}
            }),
        )
        .await;
        assert_eq!(reply.error.unwrap().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn close_waits_for_requests_already_submitted() {
        let state = test_state();
        let (handle, outbound) = state.registry.register(&ConnectionConfig::default());
        let mut requests = JoinSet::new();

        // Submitted but not yet run when the socket goes away.
        spawn_request(
            &mut requests,
            &state,
            &handle,
            register_frame(1, handle.id.0, true).to_string(),
        );

        let report = close_session(&state, handle.id, outbound, requests).await;
        assert_eq!(report.providers_removed, 1);
        assert!(state.engine.find_provider("video.play").is_none());
        assert_eq!(state.engine.stats().provider_connections, 0);
        assert_eq!(state.registry.count(), 0);
    }

    #[tokio::test]
    async fn declared_results_reach_only_the_carrying_peer() {
        let state = state_with(ContextBinding::Declared);
        let (peer, mut peer_rx) = connect(&state);
        let (bystander, mut bystander_rx) = connect(&state);
        assert_eq!((peer.0, bystander.0), (1, 2));

        // Behind the peer, app connection 1 provides and app connection 2
        // consumes; the bystander socket happens to be number 2.
        let reply = call(&state, peer, register_frame(1, 1, true)).await;
        assert_eq!(reply.result, Some(json!({"registered": true})));

        let reply = call(
            &state,
            peer,
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "invokeProvider",
                "params": {
                    "context": {"requestId": 7, "connectionId": 2, "appId": "cons"},
                    "capability": "video.play"
                }
            }),
        )
        .await;
        let correlation_id = reply.result.unwrap()["correlationId"].clone();

        let request = next_frame(&mut peer_rx).await;
        assert_eq!(request["method"], methods::PROVIDER_REQUEST);
        assert_eq!(request["params"]["context"]["connectionId"], 2);

        let reply = call(
            &state,
            peer,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "handleProviderResponse",
                "params": {"correlationId": correlation_id, "payload": {"secret": "x"}}
            }),
        )
        .await;
        assert_eq!(reply.result, Some(json!({"delivered": true})));

        let respond = next_frame(&mut peer_rx).await;
        assert_eq!(respond["method"], methods::GATEWAY_RESPOND);
        assert_eq!(
            respond["params"]["context"],
            json!({"requestId": 7, "connectionId": 2, "appId": "cons"})
        );
        assert_eq!(respond["params"]["payload"], json!({"secret": "x"}));
        assert!(bystander_rx.try_recv().is_err());

        // The bystander closing touches nothing the peer declared.
        state.registry.remove(bystander);
        assert_eq!(state.release_connection(bystander), CleanupReport::default());
        assert_eq!(state.engine.stats().providers, 1);

        // The peer closing releases every app it declared.
        state.registry.remove(peer);
        let report = state.release_connection(peer);
        assert_eq!(report.providers_removed, 1);
        assert_eq!(state.engine.stats().providers, 0);
    }
}
