use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::bridge::RelayBridge;
use crate::metrics::{RelayMetrics, RoomGauges};
use crate::rooms::RoomRegistry;
use crate::ws::{self, WsState};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct ObservabilityState {
    registry: Arc<RoomRegistry>,
    metrics: Arc<RelayMetrics>,
    bridge: RelayBridge,
}

pub fn build_router(ws_state: WsState) -> Router {
    let observability = ObservabilityState {
        registry: Arc::clone(&ws_state.registry),
        metrics: Arc::clone(&ws_state.metrics),
        bridge: ws_state.bridge.clone(),
    };

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics))
            .with_state(observability)
            .merge(ws::router(ws_state)),
    )
}

pub(crate) fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

/// Unhealthy while the bus subscription is down: this process would admit
/// connections it cannot deliver room events to.
async fn healthz(State(state): State<ObservabilityState>) -> (StatusCode, &'static str) {
    if state.bridge.is_subscribed() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "bus subscription down")
    }
}

async fn metrics(State(state): State<ObservabilityState>) -> Response {
    let gauges = RoomGauges {
        rooms: state.registry.room_count().await,
        connections: state.registry.connection_count().await,
    };
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render_prometheus(gauges),
    )
        .into_response()
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use marginalia_common::protocol::ws::decode_client_message;
    use marginalia_common::types::{PeerId, RoomId};
    use serde_json::json;
    use tokio::sync::{mpsc, watch};
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, MAX_REQUEST_BODY_BYTES};
    use crate::access::{AccessPolicy, DocumentAccessStore};
    use crate::bridge::{BridgeTasks, RelayBridge};
    use crate::bus::Bus;
    use crate::dispatch::Dispatcher;
    use crate::metrics::RelayMetrics;
    use crate::rooms::{Connection, RoomRegistry};
    use crate::ws::{Gatekeeper, HeartbeatConfig, WsState};

    fn unstarted_state() -> WsState {
        let metrics = Arc::new(RelayMetrics::default());
        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (active_sessions, _) = mpsc::channel(1);
        WsState {
            gatekeeper: Gatekeeper::new(DocumentAccessStore::in_memory(), AccessPolicy::default()),
            registry: Arc::new(RoomRegistry::default()),
            bridge: RelayBridge::new(Bus::in_memory(), Arc::clone(&metrics)),
            metrics,
            outbound_queue_capacity: 8,
            heartbeat: HeartbeatConfig::default(),
            shutdown,
            active_sessions,
        }
    }

    async fn started_state() -> (WsState, BridgeTasks) {
        let state = unstarted_state();
        let dispatcher = Dispatcher::new(Arc::clone(&state.registry), Arc::clone(&state.metrics));
        let tasks = state.bridge.start(dispatcher, 8).await.expect("memory bus should subscribe");
        (state, tasks)
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.oneshot(request).await.expect("request should succeed");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        (status, String::from_utf8(body.to_vec()).expect("body should be utf-8"))
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let (state, _tasks) = started_state().await;
        let response = build_router(state)
            .oneshot(get_request("/healthz"))
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn caller_request_id_is_echoed() {
        let (state, _tasks) = started_state().await;
        let response = build_router(state)
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.headers()["x-request-id"], "req-42");
    }

    #[tokio::test]
    async fn health_check_fails_without_a_bus_subscription() {
        let (status, body) = send(build_router(unstarted_state()), get_request("/healthz")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "bus subscription down");

        let (state, tasks) = started_state().await;
        let router = build_router(state);
        assert_eq!(send(router.clone(), get_request("/healthz")).await.0, StatusCode::OK);
        tasks.abort();
        assert_eq!(send(router, get_request("/healthz")).await.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_reports_registry_gauges() {
        let state = unstarted_state();
        let (connection, _rx) = Connection::open(PeerId::from("A"), RoomId::for_document("1"), 4);
        state.registry.join(connection).await;
        state.metrics.record_connection_opened();

        let (status, body) = send(build_router(state), get_request("/metrics")).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("relay_active_rooms 1"));
        assert!(body.contains("relay_active_connections 1"));
        assert!(body.contains("relay_connections_opened_total 1"));
    }

    #[tokio::test]
    async fn plain_get_on_ws_endpoint_is_not_upgraded() {
        let (status, _) =
            send(build_router(unstarted_state()), get_request("/ws?docId=1&userId=A")).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn panicking_route_does_not_take_the_router_down() {
        async fn lookup_room() -> &'static str {
            panic!("room lookup panicked");
        }

        let app = apply_middleware(
            Router::new()
                .route("/rooms/1", get(lookup_room))
                .route("/healthz", get(|| async { "ok" })),
        );

        let (status, _) = send(app.clone(), get_request("/rooms/1")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let (status, body) = send(app, get_request("/healthz")).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "ok"));
    }

    #[tokio::test]
    async fn oversized_annotation_body_is_refused() {
        async fn accept_annotation(body: String) -> StatusCode {
            match decode_client_message(&body) {
                Ok(_) => StatusCode::ACCEPTED,
                Err(_) => StatusCode::UNPROCESSABLE_ENTITY,
            }
        }

        let app = apply_middleware(Router::new().route("/annotations", post(accept_annotation)));
        let annotation = |note: String| {
            let frame = json!({ "type": "annotation", "annotation": { "note": note } });
            Request::builder()
                .method(Method::POST)
                .uri("/annotations")
                .header("content-type", "application/json")
                .body(Body::from(frame.to_string()))
                .expect("annotation request should build")
        };

        let (status, _) = send(app.clone(), annotation("margin note".to_owned())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = send(app, annotation("a".repeat(MAX_REQUEST_BODY_BYTES))).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
