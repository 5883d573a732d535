//! Axum handlers for the gateway surface: the proxy route, health, and
//! metrics.

use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, Method, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use portcullis_core::{
    auth::ConfigRepository,
    kv::KvStore,
    metrics::MetricsCollector,
    pipeline::{GatewayEngine, GatewayRequest, GatewayResponse},
    request_log::RequestLogHandle,
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Shared handler state.
pub struct AppState {
    pub engine: Arc<GatewayEngine>,
    pub kv: Arc<dyn KvStore>,
    pub repo: Arc<dyn ConfigRepository>,
    pub metrics: Arc<MetricsCollector>,
    pub logs: RequestLogHandle,
    /// False when running on the in-process fallback store.
    pub kv_shared: bool,
}

/// `ANY /g/{route_name}/{path...}`
pub async fn handle_gateway(
    State(state): State<Arc<AppState>>,
    Path((route_name, path)): Path<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    proxy(state, route_name, format!("/{path}"), method, query, headers, body).await
}

/// `ANY /g/{route_name}` — the bare route root.
pub async fn handle_gateway_root(
    State(state): State<Arc<AppState>>,
    Path(route_name): Path<String>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    proxy(state, route_name, "/".to_string(), method, query, headers, body).await
}

async fn proxy(
    state: Arc<AppState>,
    route_name: String,
    path: String,
    method: Method,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let request_id = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let response = state
        .engine
        .handle(GatewayRequest {
            request_id,
            method: method.as_str().to_string(),
            route_name,
            path,
            query,
            headers: header_pairs,
            body,
        })
        .await;

    into_http_response(response)
}

fn into_http_response(response: GatewayResponse) -> Response<Body> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);

    for (name, value) in &response.headers {
        match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => warn!(header = %name, "dropping unrepresentable response header"),
        }
    }

    builder.body(Body::from(response.body)).unwrap_or_else(|e| {
        warn!(error = %e, "failed to materialize response");
        let mut fallback = Response::new(Body::empty());
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}

/// `GET /health`
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let kv_ok = state.kv_shared && state.kv.ping().await.is_ok();
    let db_ok = state.repo.ping().await.is_ok();

    let body = json!({
        "status": if kv_ok && db_ok { "healthy" } else { "degraded" },
        "components": {
            "kv": if kv_ok { "ok" } else { "degraded" },
            "db": if db_ok { "ok" } else { "degraded" },
            // The bloom filter lives in the shared store and is disabled
            // whenever the gateway runs on the fallback.
            "bloom": if kv_ok { "ok" } else { "disabled" },
        },
    });

    Json(body)
}

/// `GET /metrics` — JSON counters.
pub async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot(state.logs.dropped()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::Request,
        routing::{any, get},
        Router,
    };
    use http_body_util::BodyExt;
    use portcullis_core::{
        abuse::{AbuseConfig, AbuseDetector},
        auth::SqliteRepository,
        cache::{BloomFilter, CacheSettings, ResponseCache},
        catalog::ConfigCatalog,
        kv::MemoryStore,
        pipeline::{EngineConfig, GatewayEngine},
        request_log,
        upstream::UpstreamClient,
    };
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    /// Full router over an empty catalog and the fallback KV store.
    async fn test_app() -> Router {
        let repo: Arc<dyn ConfigRepository> =
            Arc::new(SqliteRepository::in_memory().await.expect("in-memory db"));
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let catalog = ConfigCatalog::load(Arc::clone(&repo)).await.expect("catalog loads");
        let cache = Arc::new(ResponseCache::new(
            Arc::clone(&kv),
            CacheSettings::default(),
            shutdown_tx.clone(),
        ));
        let bloom = Arc::new(BloomFilter::new(Arc::clone(&kv), 1000, 0.01));
        let abuse = Arc::new(AbuseDetector::new(
            Arc::clone(&kv),
            Arc::clone(&repo),
            AbuseConfig::default(),
        ));
        let upstream =
            Arc::new(UpstreamClient::new(Duration::from_secs(5)).expect("client builds"));
        let (logs, _writer) =
            request_log::spawn_writer(Arc::clone(&repo), 128, shutdown_tx.subscribe());
        let metrics = Arc::new(MetricsCollector::new());

        let engine = Arc::new(GatewayEngine::new(
            catalog,
            Arc::clone(&kv),
            cache,
            bloom,
            abuse,
            upstream,
            Arc::clone(&repo),
            logs.clone(),
            Arc::clone(&metrics),
            EngineConfig {
                default_rate_limit_rps: 100.0,
                default_rate_limit_burst: 200,
                upstream_default_timeout: Duration::from_secs(5),
                bloom_enabled: false,
            },
        ));

        let state =
            Arc::new(AppState { engine, kv, repo, metrics, logs, kv_shared: false });
        let (set_request_id, propagate_request_id) =
            crate::middleware::create_request_id_layers();

        Router::new()
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .route("/g/:route_name", any(handle_gateway_root))
            .route("/g/:route_name/*path", any(handle_gateway))
            .with_state(state)
            .layer(propagate_request_id)
            .layer(set_request_id)
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_degraded_on_fallback_kv() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["components"]["kv"], "degraded");
        assert_eq!(body["components"]["db"], "ok");
        assert_eq!(body["components"]["bloom"], "disabled");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_returns_counters() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["requests_total"].is_number());
        assert_eq!(body["kv_degraded"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn test_gateway_route_requires_api_key() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/g/demo/items").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(
            response.headers().get("x-request-id").is_some(),
            "error responses still carry a request id"
        );
        let body = body_json(response).await;
        assert_eq!(body["error"], "missing_api_key");
    }

    #[tokio::test]
    async fn test_request_id_preserved_from_client() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/g/demo/items")
                    .header("x-request-id", "client-supplied-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let header = response.headers().get("x-request-id").unwrap();
        assert_eq!(header.to_str().unwrap(), "client-supplied-id");
        let body = body_json(response).await;
        assert_eq!(body["request_id"], "client-supplied-id");
    }

    #[tokio::test]
    async fn test_bare_route_root_is_routed() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/g/demo").body(Body::empty()).unwrap())
            .await
            .unwrap();

        // Reaches the pipeline (which rejects for the missing key) instead
        // of falling through to a router 404.
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
