//! HTTP-level layers for the broker's router.
//!
//! These wrap the health checks and the WebSocket upgrade handshake only.
//! Per-call JSON-RPC concerns (load shedding, deadlines, metrics) live in
//! `service::middleware`.

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::config::NetworkConfig;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Wraps `router` in the HTTP layers, outermost first:
/// 1. `SetRequestId` -- assigns a UUID `x-request-id` when the client sent none
/// 2. `Trace` -- one span per HTTP request
/// 3. `CORS` -- origins from `NetworkConfig::cors_origins`
/// 4. `Timeout` -- 408 when a handler exceeds `request_timeout`
/// 5. `PropagateRequestId` -- echoes `x-request-id` on the response
pub fn with_http_layers<S>(router: Router<S>, config: &NetworkConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(REQUEST_ID, MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&config.cors_origins))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                config.request_timeout,
            ))
            .layer(PropagateRequestIdLayer::new(REQUEST_ID)),
    )
}

/// `"*"` anywhere in `origins` allows any origin; otherwise only the origins
/// that parse as header values are allowed.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(%origin, "ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request};
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;

    fn app(config: &NetworkConfig) -> Router {
        with_http_layers(Router::new().route("/health", get(|| async { "ok" })), config)
    }

    #[tokio::test]
    async fn request_id_is_generated_and_echoed() {
        let response = app(&NetworkConfig::default())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID));
    }

    #[tokio::test]
    async fn client_request_id_is_kept() {
        let response = app(&NetworkConfig::default())
            .oneshot(
                Request::get("/health")
                    .header(REQUEST_ID, "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[REQUEST_ID], "abc-123");
    }

    #[tokio::test]
    async fn listed_origin_is_allowed() {
        let config = NetworkConfig {
            cors_origins: vec!["https://apps.example".to_string(), "\n".to_string()],
            ..NetworkConfig::default()
        };
        let response = app(&config)
            .oneshot(
                Request::get("/health")
                    .header(header::ORIGIN, "https://apps.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://apps.example"
        );
    }
}
