use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, warn};
use uuid::Uuid;

use ppm_signal::{parse_webhook, ParsedWebhook};

use crate::api_types::{
    BadRequestResponse, HealthResponse, LeaderResponse, ReadyResponse, WebhookResponse,
};
use crate::rate_limit::client_ip;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/coordinator/leader", get(coordinator_leader))
        .with_state(state)
}

/// Short correlation id carried by every response and log line of a request.
fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ---------------------------------------------------------------------------
// POST /webhook
// ---------------------------------------------------------------------------

pub(crate) async fn webhook(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let request_id = new_request_id();

    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr.ip()));
    if !st.rate_limiter.allow(ip) {
        warn!(%ip, request_id, "webhook rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(BadRequestResponse {
                error: "rate_limited",
                request_id,
                field: None,
                detail: format!(
                    "more than {} requests in the rolling minute",
                    st.pipeline.rate_limit_per_min
                ),
            }),
        )
            .into_response();
    }

    if body.len() > st.pipeline.max_payload_bytes {
        warn!(request_id, bytes = body.len(), "webhook payload too large");
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(BadRequestResponse {
                error: "payload_too_large",
                request_id,
                field: None,
                detail: format!("payload exceeds {} bytes", st.pipeline.max_payload_bytes),
            }),
        )
            .into_response();
    }

    let json: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(BadRequestResponse {
                    error: "malformed_json",
                    request_id,
                    field: None,
                    detail: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let parsed = match parse_webhook(&json) {
        Ok(p) => p,
        Err(e) => {
            info!(request_id, field = e.field, %e, "webhook contract violation");
            return (
                StatusCode::BAD_REQUEST,
                Json(BadRequestResponse {
                    error: "contract_violation",
                    request_id,
                    field: Some(e.field.to_string()),
                    detail: e.problem,
                }),
            )
                .into_response();
        }
    };

    match parsed {
        ParsedWebhook::Monitor(monitor) => {
            // Accepted and logged; execution side effects are out of scope.
            info!(
                request_id,
                instrument = %monitor.instrument,
                position_status = monitor.position_status.as_deref().unwrap_or("-"),
                "EOD monitor signal received"
            );
            (
                StatusCode::OK,
                Json(WebhookResponse {
                    status: "ignored",
                    request_id,
                    result: None,
                    reason: None,
                }),
            )
                .into_response()
        }
        ParsedWebhook::Trading(signal) => {
            info!(
                request_id,
                kind = %signal.kind,
                instrument = %signal.instrument,
                slot = %signal.slot,
                price = signal.price,
                "signal received"
            );
            let outcome = st.engine.process_signal(&signal).await;
            info!(request_id, outcome = ?outcome, "signal settled");
            (
                StatusCode::OK,
                Json(WebhookResponse::from_outcome(request_id, outcome)),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /health: process liveness, no dependencies checked
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /ready: 200 only when DB and cache both answer
// ---------------------------------------------------------------------------

pub(crate) async fn ready(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = match &st.persistence {
        Some(db) => ppm_db::ping(db.pool()).await.is_ok(),
        None => false,
    };
    let cache_ok = match &st.lease {
        Some(lease) => lease.ping().await.is_ok(),
        None => false,
    };
    let ready = db_ok && cache_ok;
    (
        if ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        },
        Json(ReadyResponse {
            ready,
            db_ok,
            cache_ok,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /coordinator/leader
// ---------------------------------------------------------------------------

pub(crate) async fn coordinator_leader(State(st): State<Arc<AppState>>) -> Response {
    match &st.coordinator {
        Some(coordinator) => {
            let status = coordinator.status().await;
            (
                StatusCode::OK,
                Json(LeaderResponse {
                    coordinator: status,
                    validator_metrics: st.engine.validator_metrics().snapshot(),
                }),
            )
                .into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "no_coordinator",
                "detail": "this deployment runs without HA coordination"
            })),
        )
            .into_response(),
    }
}
