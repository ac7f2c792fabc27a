//! Router assembly and operational endpoints.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::config::Settings;
use crate::handlers::{self, AppState, MAX_MINIDUMP_SIZE};
use crate::metrics;
use crate::ratelimit;

/// Build the full application router: ingest routes, ops routes, rate
/// limiting, and CORS.
pub fn build_router(state: AppState) -> Router {
    let ingest = Router::new()
        .route("/api/{project_id}/envelope/", post(handlers::receive_envelope))
        .route("/api/{project_id}/envelope", post(handlers::receive_envelope))
        .route("/api/{project_id}/store/", post(handlers::receive_store))
        .route("/api/{project_id}/store", post(handlers::receive_store))
        .route("/api/{project_id}/security/", post(handlers::receive_security))
        .route("/api/{project_id}/security", post(handlers::receive_security))
        .route("/api/{project_id}/", get(handlers::project_probe))
        .layer(DefaultBodyLimit::max(state.settings.max_request_size));

    let minidump = Router::new()
        .route("/api/{project_id}/minidump/", post(handlers::receive_minidump))
        .route("/api/{project_id}/minidump", post(handlers::receive_minidump))
        .layer(DefaultBodyLimit::max(MAX_MINIDUMP_SIZE));

    let ops = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats));

    let mut app = Router::new()
        .merge(ingest)
        .merge(minidump)
        .merge(ops)
        .with_state(state.clone());

    if state.settings.rate_limit_enabled {
        app = app.layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::middleware,
        ));
    }

    if let Some(cors) = cors_layer(&state.settings) {
        app = app.layer(cors);
    }

    app
}

/// Cross-origin policy: configured origins when set, everything in debug mode,
/// otherwise no CORS headers at all (cross-origin requests are denied).
fn cors_layer(settings: &Settings) -> Option<CorsLayer> {
    if !settings.allowed_cors_origins.is_empty() {
        let origins: Vec<HeaderValue> = settings
            .allowed_cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        Some(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    HeaderName::from_static("x-sentry-auth"),
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                ]),
        )
    } else if settings.debug {
        Some(CorsLayer::permissive())
    } else {
        None
    }
}

/// GET /health: liveness.
async fn health(State(state): State<AppState>) -> Response {
    let body = json!({
        "status": "healthy",
        "app": state.settings.app_name,
        "version": env!("CARGO_PKG_VERSION"),
        "batcher": {
            "running": state.batcher.is_running(),
            "pending_events": state.batcher.pending_count().await,
        }
    });
    Json(body).into_response()
}

/// GET /ready: the cluster must answer and not be red.
async fn ready(State(state): State<AppState>) -> Response {
    let mut checks = serde_json::Map::new();
    let mut is_ready = true;

    match state.client.cluster_health().await {
        Ok(health) => {
            let status = health["status"].as_str().unwrap_or("unknown").to_string();
            let ok = status == "green" || status == "yellow";
            checks.insert(
                "opensearch".to_string(),
                json!({
                    "status": if ok { "ok" } else { "degraded" },
                    "cluster_status": status,
                    "cluster_name": health["cluster_name"],
                    "number_of_nodes": health["number_of_nodes"],
                }),
            );
            if !ok {
                is_ready = false;
            }
        }
        Err(e) => {
            checks.insert(
                "opensearch".to_string(),
                json!({"status": "error", "error": e.to_string()}),
            );
            is_ready = false;
        }
    }

    checks.insert(
        "batcher".to_string(),
        json!({
            "status": if state.batcher.is_running() { "ok" } else { "stopped" },
            "pending_events": state.batcher.pending_count().await,
        }),
    );

    if is_ready {
        Json(json!({"status": "ready", "checks": checks})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "checks": checks})),
        )
            .into_response()
    }
}

/// GET /metrics: Prometheus exposition format.
async fn metrics_endpoint() -> Response {
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        metrics::gather(),
    )
        .into_response()
}

/// GET /stats: index counts and sizes snapshot.
async fn stats(State(state): State<AppState>) -> Response {
    match state.client.index_stats().await {
        Ok(stats) => {
            let indices = stats["indices"]
                .as_object()
                .map(|m| m.len())
                .unwrap_or(0);
            let total_docs = lookup_u64(&stats, &["_all", "primaries", "docs", "count"]);
            let total_size = lookup_u64(&stats, &["_all", "primaries", "store", "size_in_bytes"]);
            Json(json!({
                "indices": indices,
                "total_docs": total_docs,
                "total_size_bytes": total_size,
            }))
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to fetch index stats");
            Json(json!({"error": e.to_string()})).into_response()
        }
    }
}

fn lookup_u64(value: &Value, path: &[&str]) -> u64 {
    let mut current = value;
    for key in path {
        current = &current[key];
    }
    current.as_u64().unwrap_or(0)
}
