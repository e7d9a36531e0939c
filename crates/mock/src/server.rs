//! HTTP surface of the mock control-plane server

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use parking_lot::Mutex;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{MockError, MockResult};
use crate::state::MockState;

pub const LISTS_PATH: &str = "/api/runtime/firewall/lists";

/// Routes the test driver keeps reaching while an outage is simulated.
const OUTAGE_EXEMPT_PATHS: &[&str] = &[
    "/mock/config",
    "/mock/down",
    "/mock/up",
    "/mock/events",
    "/mock/token",
    "/tests/simple",
];

/// Mock server configuration
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Latency of the `/tests/simple` liveness endpoint
    pub liveness_delay: Duration,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            liveness_delay: Duration::from_secs(1),
        }
    }
}

/// Mock control-plane server
#[derive(Clone)]
pub struct MockServer {
    shared: Arc<MockShared>,
}

struct MockShared {
    state: Mutex<MockState>,
    cfg: MockServerConfig,
}

pub async fn serve(addr: SocketAddr, state: MockState, cfg: MockServerConfig) -> anyhow::Result<()> {
    MockServer::new(state, cfg).serve(addr).await
}

impl MockServer {
    pub fn new(state: MockState, cfg: MockServerConfig) -> Self {
        Self {
            shared: Arc::new(MockShared {
                state: Mutex::new(state),
                cfg,
            }),
        }
    }

    /// Create router
    pub fn router(&self) -> Router {
        Router::new()
            // Agent-facing control plane
            .route("/config", get(config_version_handler))
            .route("/api/runtime/config", get(runtime_config_handler))
            .route(LISTS_PATH, get(lists_handler))
            .route("/api/runtime/events", post(post_event_handler))
            // Test driver controls
            .route("/mock/config", post(mock_set_config_handler))
            .route("/mock/down", post(mock_down_handler))
            .route("/mock/up", post(mock_up_handler))
            .route("/mock/events", get(mock_events_handler))
            .route("/mock/token", get(mock_token_handler))
            .route("/tests/simple", get(tests_simple_handler))
            .fallback(not_found_handler)
            .layer(middleware::from_fn_with_state(
                self.shared.clone(),
                gate_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.shared.clone())
    }

    /// Start the mock server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Mock control plane listening on http://{}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Runs ahead of every handler: captures the credential, enforces encoding
/// negotiation on the lists endpoint, then applies the simulated outage.
async fn gate_middleware(
    State(shared): State<Arc<MockShared>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let down = {
        let mut state = shared.state.lock();
        if let Some(token) = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            state.capture_token(token);
        }
        state.is_down()
    };

    if path == LISTS_PATH && !accepts_gzip(request.headers()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Accept-Encoding must include gzip" })),
        )
            .into_response();
    }

    if down && !OUTAGE_EXEMPT_PATHS.contains(&path.as_str()) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "Service Unavailable" })),
        )
            .into_response();
    }

    next.run(request).await
}

/// True when `Accept-Encoding` lists gzip with a non-zero quality.
fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|entry| {
            let mut parts = entry.split(';').map(str::trim);
            let coding = parts.next().unwrap_or_default();
            let rejected = parts.any(|p| {
                p.strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .map(|q| q == 0.0)
                    .unwrap_or(false)
            });
            coding.eq_ignore_ascii_case("gzip") && !rejected
        })
}

fn gzip_json(value: &Value) -> MockResult<Vec<u8>> {
    let body = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&body)?;
    Ok(encoder.finish()?)
}

// ============================================================================
// Handlers
// ============================================================================

async fn config_version_handler(State(shared): State<Arc<MockShared>>) -> impl IntoResponse {
    Json(shared.state.lock().config_version())
}

async fn runtime_config_handler(State(shared): State<Arc<MockShared>>) -> impl IntoResponse {
    Json(shared.state.lock().runtime_config())
}

async fn lists_handler(State(shared): State<Arc<MockShared>>) -> MockResult<Response> {
    let payload = shared.state.lock().lists_payload();
    let body = gzip_json(&payload)?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CONTENT_ENCODING, "gzip"),
        ],
        body,
    )
        .into_response())
}

async fn post_event_handler(State(shared): State<Arc<MockShared>>, body: Bytes) -> impl IntoResponse {
    let mut state = shared.state.lock();
    match serde_json::from_slice::<Value>(&body) {
        Ok(event) => {
            debug!("Got event: {}", event);
            state.record_event(event);
        }
        Err(e) => debug!("Ignoring non-JSON event body: {}", e),
    }
    Json(state.runtime_config())
}

/// Always answers 200; a body that is not a JSON object leaves the config as is.
async fn mock_set_config_handler(State(shared): State<Arc<MockShared>>, body: Bytes) -> impl IntoResponse {
    let applied = serde_json::from_slice::<Value>(&body)
        .map_err(MockError::from)
        .and_then(|config| shared.state.lock().apply_config(config));
    match applied {
        Ok(version) => info!("Config updated (configUpdatedAt={})", version),
        Err(e) => warn!("Config update ignored: {}", e),
    }
    Json(serde_json::json!({}))
}

async fn mock_down_handler(State(shared): State<Arc<MockShared>>) -> impl IntoResponse {
    shared.state.lock().set_down(true);
    info!("Simulating control plane outage");
    Json(serde_json::json!({}))
}

async fn mock_up_handler(State(shared): State<Arc<MockShared>>) -> impl IntoResponse {
    shared.state.lock().set_down(false);
    info!("Control plane back up");
    Json(serde_json::json!({}))
}

async fn mock_events_handler(State(shared): State<Arc<MockShared>>) -> impl IntoResponse {
    Json(shared.state.lock().events().to_vec())
}

async fn mock_token_handler(State(shared): State<Arc<MockShared>>) -> impl IntoResponse {
    Json(serde_json::json!({ "token": shared.state.lock().auth_token() }))
}

async fn tests_simple_handler(State(shared): State<Arc<MockShared>>) -> impl IntoResponse {
    tokio::time::sleep(shared.cfg.liveness_delay).await;
    Json("{}")
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not Found" })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;
    use tower::ServiceExt;

    fn test_server() -> MockServer {
        let mut state = MockState::new();
        state.apply_config(json!({"serviceId": 1})).unwrap();
        MockServer::new(
            state,
            MockServerConfig {
                liveness_delay: Duration::from_millis(1),
            },
        )
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn lists_req(accept_encoding: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(LISTS_PATH);
        if let Some(value) = accept_encoding {
            builder = builder.header(header::ACCEPT_ENCODING, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn gunzip_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let mut decoded = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
        serde_json::from_str(&decoded).unwrap()
    }

    #[tokio::test]
    async fn test_config_version_endpoint() {
        let router = test_server().router();
        let response = send(&router, get_req("/config")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["serviceId"], 1);
        assert!(json["configUpdatedAt"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_lists_require_gzip_acceptance() {
        let router = test_server().router();

        let response = send(&router, lists_req(None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&router, lists_req(Some("deflate, br"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&router, lists_req(Some("gzip;q=0"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // A wildcard does not name gzip
        let response = send(&router, lists_req(Some("*"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&router, lists_req(Some("br, gzip"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        let json = gunzip_json(response).await;
        assert_eq!(json["success"], true);
    }

    #[tokio::test]
    async fn test_lists_negotiation_checked_while_down() {
        let router = test_server().router();
        send(&router, post_json("/mock/down", json!({}))).await;

        let response = send(&router, lists_req(None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&router, lists_req(Some("gzip"))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_blocked_ips_move_to_lists() {
        let router = test_server().router();

        let response = send(
            &router,
            post_json(
                "/mock/config",
                json!({"serviceId": 1, "blockedIPAddresses": ["1.2.3.4"]}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let lists = gunzip_json(send(&router, lists_req(Some("gzip"))).await).await;
        assert_eq!(lists["blockedIPAddresses"], json!(["1.2.3.4"]));

        let config = body_json(send(&router, get_req("/api/runtime/config")).await).await;
        assert!(config.get("blockedIPAddresses").is_none());
        assert_eq!(config["serviceId"], 1);
    }

    #[tokio::test]
    async fn test_outage_toggle_keeps_events() {
        let router = test_server().router();

        send(&router, post_json("/api/runtime/events", json!({"type": "started"}))).await;
        let before = body_json(send(&router, get_req("/config")).await).await;

        send(&router, post_json("/mock/down", json!({}))).await;
        for uri in ["/config", "/api/runtime/config"] {
            let response = send(&router, get_req(uri)).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        }
        let response = send(&router, post_json("/api/runtime/events", json!({"type": "heartbeat"}))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Driver endpoints stay reachable during the outage
        let events = body_json(send(&router, get_req("/mock/events")).await).await;
        assert_eq!(events, json!([{"type": "started"}]));
        let response = send(&router, get_req("/tests/simple")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = send(&router, get_req("/mock/token")).await;
        assert_eq!(response.status(), StatusCode::OK);

        send(&router, post_json("/mock/up", json!({}))).await;
        let response = send(&router, get_req("/config")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let after = body_json(response).await;
        assert_eq!(after["configUpdatedAt"], before["configUpdatedAt"]);

        let events = body_json(send(&router, get_req("/mock/events")).await).await;
        assert_eq!(events.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_config_update_while_down_is_accepted() {
        let router = test_server().router();
        send(&router, post_json("/mock/down", json!({}))).await;

        let response = send(&router, post_json("/mock/config", json!({"serviceId": 2}))).await;
        assert_eq!(response.status(), StatusCode::OK);

        send(&router, post_json("/mock/up", json!({}))).await;
        let version = body_json(send(&router, get_req("/config")).await).await;
        assert_eq!(version["serviceId"], 2);
    }

    #[tokio::test]
    async fn test_events_are_append_ordered() {
        let router = test_server().router();
        for i in 0..5 {
            let response = send(
                &router,
                post_json("/api/runtime/events", json!({"type": "heartbeat", "seq": i})),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
            // The event endpoint answers with the runtime config
            assert_eq!(body_json(response).await["serviceId"], 1);
        }

        let events = body_json(send(&router, get_req("/mock/events")).await).await;
        let seqs: Vec<i64> = events
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_non_json_event_is_acknowledged_but_not_stored() {
        let router = test_server().router();
        let request = Request::builder()
            .method("POST")
            .uri("/api/runtime/events")
            .body(Body::from("not json"))
            .unwrap();
        let response = send(&router, request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let events = body_json(send(&router, get_req("/mock/events")).await).await;
        assert_eq!(events, json!([]));
    }

    #[tokio::test]
    async fn test_token_captured_from_any_request() {
        let router = test_server().router();
        let token = body_json(send(&router, get_req("/mock/token")).await).await;
        assert_eq!(token["token"], Value::Null);

        let request = Request::builder()
            .uri("/config")
            .header(header::AUTHORIZATION, "AIK_RUNTIME_MOCK")
            .body(Body::empty())
            .unwrap();
        send(&router, request).await;

        let token = body_json(send(&router, get_req("/mock/token")).await).await;
        assert_eq!(token["token"], "AIK_RUNTIME_MOCK");
    }

    #[tokio::test]
    async fn test_invalid_config_update_ignored() {
        let router = test_server().router();
        let before = body_json(send(&router, get_req("/config")).await).await;

        let response = send(&router, post_json("/mock/config", json!(["not", "an", "object"]))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let after = body_json(send(&router, get_req("/config")).await).await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let router = test_server().router();
        let response = send(&router, get_req("/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
