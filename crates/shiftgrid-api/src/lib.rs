//! shiftgrid-api: operator REST API.
//!
//! Axum route handlers over the pipeline, the per-tier deployment
//! controllers and the datastore replica router.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/releases` | Submit a release (starts a pipeline run) |
//! | GET | `/api/v1/runs` | List pipeline runs |
//! | GET | `/api/v1/runs/{id}` | Get one run with its plans |
//! | POST | `/api/v1/runs/{id}/abort` | Abort an active run |
//! | GET | `/api/v1/tiers` | Tier summaries in pipeline order |
//! | GET | `/api/v1/tiers/{tier}` | Routing table, slots and controller state |
//! | GET | `/api/v1/health` | Health of every monitored entity |
//! | GET | `/api/v1/datastore` | Primary, write target and node list |
//! | GET | `/api/v1/datastore/history` | Role history |
//! | POST | `/api/v1/datastore/{node}/promote` | Manual promotion |
//! | POST | `/api/v1/datastore/{node}/lag` | Report replication lag |
//! | GET | `/healthz` | Liveness |

pub mod datastore_handlers;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use shiftgrid_health::HealthRegistry;
use shiftgrid_pipeline::PipelineController;
use shiftgrid_routing::ReplicaRouter;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: PipelineController,
    pub registry: HealthRegistry,
    /// Absent when no datastore is configured.
    pub replica: Option<Arc<ReplicaRouter>>,
}

/// Build the complete operator router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/releases", post(handlers::submit_release))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}/abort", post(handlers::abort_run))
        .route("/tiers", get(handlers::list_tiers))
        .route("/tiers/{tier}", get(handlers::get_tier))
        .route("/health", get(handlers::health_snapshot))
        .route("/datastore", get(datastore_handlers::get_datastore))
        .route("/datastore/history", get(datastore_handlers::role_history))
        .route("/datastore/{node}/promote", post(datastore_handlers::promote_node))
        .route("/datastore/{node}/lag", post(datastore_handlers::report_lag))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(|| async { "ok" }))
}
