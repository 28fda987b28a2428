//! fleetgrid-api: REST control surface for FleetGrid.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/status` | Pool sizes, snapshot version, last decision, admission counters |
//! | GET | `/api/v1/instances` | Instance list |
//! | GET | `/api/v1/decisions` | Applied decisions, most recent first (`?limit=n`) |
//! | POST | `/api/v1/scale` | Manual scaling decision (`{"target": n}`) |
//! | GET | `/api/v1/replicas` | Replica lag table |
//! | GET | `/api/v1/cache/shards` | Cache ring membership |
//! | GET | `/api/v1/config` | Effective configuration |
//! | GET | `/healthz` | Control plane liveness |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod prometheus;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use fleet_core::FleetConfig;
use fleetgrid_admission::AdmissionCounters;
use fleetgrid_cache::CacheRouter;
use fleetgrid_data::DataRouter;
use fleetgrid_pool::WorkerPool;
use fleetgrid_state::StateStore;

pub use prometheus::{FleetMetrics, render_prometheus};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<FleetConfig>,
    pub store: StateStore,
    pub pool: Arc<WorkerPool>,
    pub admission: Arc<AdmissionCounters>,
    /// Absent when no data store is configured.
    pub data: Option<Arc<DataRouter>>,
    /// Absent when no cache shards are configured.
    pub cache: Option<Arc<CacheRouter>>,
}

/// Build the complete API router (REST + liveness + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/instances", get(handlers::list_instances))
        .route("/decisions", get(handlers::list_decisions))
        .route("/scale", post(handlers::manual_scale))
        .route("/replicas", get(handlers::list_replicas))
        .route("/cache/shards", get(handlers::cache_shards))
        .route("/config", get(handlers::effective_config))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
