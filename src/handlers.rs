//! Ingestion endpoints for Sentry-compatible SDKs.
//!
//! Every ingest route runs the same gauntlet: project allow-list, DSN key
//! auth, body-size limits, then decoding and hand-off to the event sink.
//! Per-item decode problems skip the item instead of failing the request; the
//! ingestion contract is fire-and-forget from the client's point of view.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::CONTENT_LENGTH, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{self, DsnAuth};
use crate::batcher::Batcher;
use crate::client::SearchClient;
use crate::config::Settings;
use crate::envelope;
use crate::event;
use crate::metrics;
use crate::pipeline::{EventSink, Pipeline, SinkError};
use crate::ratelimit::RateLimiter;

/// Native crash dumps get a larger cap than regular payloads.
pub const MAX_MINIDUMP_SIZE: usize = 50 * 1024 * 1024;

/// Shared application state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub auth: Arc<DsnAuth>,
    pub sink: Arc<dyn EventSink>,
    pub batcher: Arc<Batcher>,
    pub client: Arc<SearchClient>,
    pub pipeline: Arc<Pipeline>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"detail": message}))).into_response()
}

fn accepted(id: Option<&str>) -> Response {
    Json(json!({"id": id})).into_response()
}

/// Project allow-list, auth, and declared-size checks shared by all ingest
/// routes. Returns the error response to send when any gate fails.
fn ingest_gate(
    state: &AppState,
    project_id: u64,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
    max_size: usize,
) -> Option<Response> {
    if !state.settings.project_allowed(project_id) {
        return Some(detail(StatusCode::NOT_FOUND, "Project not found"));
    }

    let auth_header = headers.get("x-sentry-auth").and_then(|v| v.to_str().ok());
    if state.auth.authenticate(auth_header, params).is_err() {
        warn!(project_id, "rejected request with invalid authentication");
        return Some(detail(StatusCode::UNAUTHORIZED, "Invalid authentication"));
    }

    if declared_length(headers).map(|n| n > max_size).unwrap_or(false) {
        return Some(detail(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("Request body too large. Maximum size: {max_size} bytes"),
        ));
    }

    None
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
}

/// POST /api/{project_id}/envelope/
pub async fn receive_envelope(
    State(state): State<AppState>,
    Path(project_id): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let max_size = state.settings.max_request_size;
    if let Some(response) = ingest_gate(&state, project_id, &headers, &params, max_size) {
        return response;
    }
    if body.len() > max_size {
        return detail(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("Request body too large. Maximum size: {max_size} bytes"),
        );
    }
    if body.is_empty() {
        return accepted(None);
    }

    let envelope = envelope::decode(&body);
    if envelope.malformed_header && envelope.items.is_empty() {
        return detail(StatusCode::BAD_REQUEST, "Invalid envelope format");
    }

    // SDKs echo their DSN in the envelope header; a mismatch with the URL
    // project is worth surfacing even though the URL wins.
    if let Some(dsn) = envelope.header.dsn.as_deref() {
        if let Some(dsn_project) = auth::project_id_from_dsn(dsn) {
            if dsn_project != project_id {
                warn!(
                    project_id,
                    dsn_project, "envelope dsn names a different project"
                );
            }
        }
    }

    let mut event_ids: Vec<String> = Vec::new();
    for payload in envelope.events() {
        let event = event::decode(payload);
        let event_id = event
            .event_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| envelope.header.event_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        metrics::EVENTS_RECEIVED.inc();
        match state.sink.submit(event, project_id, event_id.clone()).await {
            Ok(()) => event_ids.push(event_id),
            Err(SinkError::AtCapacity) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"error": "Event buffer full, retry later"})),
                )
                    .into_response();
            }
            Err(e) => {
                // One broken item must not fail the rest of the envelope.
                error!(event_id = %event_id, error = %e, "failed to enqueue event");
            }
        }
    }

    info!(
        project_id,
        events = event_ids.len(),
        items = envelope.items.len(),
        "envelope received"
    );

    let response_id = event_ids
        .first()
        .cloned()
        .or_else(|| envelope.header.event_id.clone());
    accepted(response_id.as_deref())
}

/// POST /api/{project_id}/store/, the legacy single-event format.
pub async fn receive_store(
    State(state): State<AppState>,
    Path(project_id): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let max_size = state.settings.max_request_size;
    if let Some(response) = ingest_gate(&state, project_id, &headers, &params, max_size) {
        return response;
    }
    if body.len() > max_size {
        return detail(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("Request body too large. Maximum size: {max_size} bytes"),
        );
    }
    if body.is_empty() {
        return accepted(None);
    }

    let event = event::decode(&body);
    let event_id = event
        .event_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    metrics::EVENTS_RECEIVED.inc();
    match state.sink.submit(event, project_id, event_id.clone()).await {
        Ok(()) => {
            info!(project_id, event_id = %event_id, "store event received");
            accepted(Some(&event_id))
        }
        Err(SinkError::AtCapacity) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Event buffer full, retry later"})),
        )
            .into_response(),
        Err(e) => {
            error!(event_id = %event_id, error = %e, "failed to enqueue store event");
            detail(StatusCode::BAD_REQUEST, "Invalid event format")
        }
    }
}

/// POST /api/{project_id}/minidump/. Native dumps are acknowledged only.
pub async fn receive_minidump(
    State(state): State<AppState>,
    Path(project_id): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    _body: Bytes,
) -> Response {
    if let Some(response) = ingest_gate(&state, project_id, &headers, &params, MAX_MINIDUMP_SIZE) {
        return response;
    }

    info!(project_id, "minidump received");
    Json(json!({"id": null, "status": "acknowledged"})).into_response()
}

/// POST /api/{project_id}/security/ for CSP and other browser reports.
pub async fn receive_security(
    State(state): State<AppState>,
    Path(project_id): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let max_size = state.settings.max_request_size;
    if let Some(response) = ingest_gate(&state, project_id, &headers, &params, max_size) {
        return response;
    }

    if !body.is_empty() {
        info!(project_id, bytes = body.len(), "security report received");
    }
    accepted(None)
}

/// GET /api/{project_id}/, the SDK connectivity probe.
pub async fn project_probe(
    State(state): State<AppState>,
    Path(project_id): Path<u64>,
) -> Response {
    if !state.settings.project_allowed(project_id) {
        return detail(StatusCode::NOT_FOUND, "Project not found");
    }
    Json(json!({"project_id": project_id, "status": "ok"})).into_response()
}
