//! REST API handlers.
//!
//! Handlers read live state from the pool and routers, and history from
//! the `StateStore`. Every JSON response uses the `ApiResponse` envelope.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use fleetgrid_admission::AdmissionStats;
use fleetgrid_pool::{PoolError, PoolStatus, RejectReason};
use fleetgrid_state::{ScalingDecision, epoch_millis};

use crate::ApiState;
use crate::prometheus::{FleetMetrics, render_prometheus};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusBody {
    pub pool: PoolStatus,
    pub admission: AdmissionStats,
    /// `None` when no data store is configured.
    pub primary_reachable: Option<bool>,
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(StatusBody {
        pool: state.pool.status(),
        admission: state.admission.stats(),
        primary_reachable: state.data.as_ref().map(|d| d.primary_reachable()),
    })
}

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.pool.status().instances)
}

// ── Decisions ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DecisionsQuery {
    pub limit: Option<usize>,
}

const DEFAULT_DECISION_LIMIT: usize = 20;

/// GET /api/v1/decisions
pub async fn list_decisions(
    State(state): State<ApiState>,
    Query(query): Query<DecisionsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_DECISION_LIMIT);
    match state.store.list_decisions(limit) {
        Ok(decisions) => ApiResponse::ok(decisions).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Scaling ────────────────────────────────────────────────────

/// Scale request body.
#[derive(Deserialize)]
pub struct ScaleRequest {
    pub target: u32,
}

/// POST /api/v1/scale
pub async fn manual_scale(
    State(state): State<ApiState>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    // Stay ahead of the applied decision's timestamp.
    let floor = state
        .pool
        .applied_decision()
        .map_or(0, |d| d.decided_at.saturating_add(1));
    let decision = ScalingDecision::manual(req.target, epoch_millis().max(floor));

    match state.pool.apply_scaling_decision(decision).await {
        Ok(outcome) => {
            info!(target = req.target, "manual scaling decision applied");
            ApiResponse::ok(outcome).into_response()
        }
        Err(PoolError::Rejected(reason @ RejectReason::OutOfBounds { .. })) => {
            error_response(&reason.to_string(), StatusCode::BAD_REQUEST).into_response()
        }
        Err(PoolError::Rejected(reason)) => {
            error_response(&reason.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Routers ────────────────────────────────────────────────────

/// GET /api/v1/replicas
pub async fn list_replicas(State(state): State<ApiState>) -> impl IntoResponse {
    let table = state
        .data
        .as_ref()
        .map(|data| data.lag_table())
        .unwrap_or_default();
    ApiResponse::ok(table)
}

/// GET /api/v1/cache/shards
pub async fn cache_shards(State(state): State<ApiState>) -> impl IntoResponse {
    match &state.cache {
        Some(cache) => ApiResponse::ok(cache.shard_map()).into_response(),
        None => error_response("no cache cluster configured", StatusCode::NOT_FOUND).into_response(),
    }
}

/// GET /api/v1/config
pub async fn effective_config(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.config.as_ref().clone())
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let pool = state.pool.status();
    let replicas = state
        .data
        .as_ref()
        .map(|data| data.lag_table())
        .unwrap_or_default();

    let body = render_prometheus(&FleetMetrics {
        pool: &pool,
        admission: state.admission.stats(),
        replicas: &replicas,
    });
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
