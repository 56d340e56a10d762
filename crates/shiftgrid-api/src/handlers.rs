//! REST API handlers for releases, runs, tiers and health.
//!
//! Each handler reads from the pipeline or a tier controller and returns
//! JSON in the `{success, data, error}` envelope.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use shiftgrid_pipeline::PipelineError;
use shiftgrid_rollout::{ControllerState, DeploymentController};
use shiftgrid_state::{HealthStatus, InstanceSlot, Revision, RoutingTable, RunId, TierId};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn pipeline_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Conflict | PipelineError::NotActive(_) => StatusCode::CONFLICT,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::UnknownTier(_)
        | PipelineError::TierMismatch { .. }
        | PipelineError::EmptyRelease => StatusCode::BAD_REQUEST,
        PipelineError::MissingController(_) | PipelineError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ── Releases ───────────────────────────────────────────────────

/// Release request body: artifact per tier.
#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub artifacts: BTreeMap<TierId, String>,
}

#[derive(Debug, Serialize)]
pub struct ReleaseAccepted {
    pub run_id: RunId,
}

/// POST /api/v1/releases
pub async fn submit_release(
    State(state): State<ApiState>,
    Json(req): Json<ReleaseRequest>,
) -> impl IntoResponse {
    let release: BTreeMap<TierId, Revision> = req
        .artifacts
        .iter()
        .map(|(tier, artifact)| (tier.clone(), Revision::new(tier, artifact)))
        .collect();

    match state.pipeline.submit_release(release) {
        Ok(run_id) => {
            info!(run = %run_id, tiers = req.artifacts.len(), "release accepted");
            (StatusCode::ACCEPTED, ApiResponse::ok(ReleaseAccepted { run_id })).into_response()
        }
        Err(e) => error_response(&e.to_string(), pipeline_status(&e)).into_response(),
    }
}

// ── Runs ───────────────────────────────────────────────────────

/// GET /api/v1/runs
pub async fn list_runs(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.pipeline.list_runs())
}

/// GET /api/v1/runs/{id}
pub async fn get_run(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.pipeline.status(&id) {
        Some(run) => ApiResponse::ok(run).into_response(),
        None => error_response("run not found", StatusCode::NOT_FOUND).into_response(),
    }
}

/// POST /api/v1/runs/{id}/abort
pub async fn abort_run(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.pipeline.abort(&id) {
        Ok(()) => ApiResponse::ok("aborting").into_response(),
        Err(e) => error_response(&e.to_string(), pipeline_status(&e)).into_response(),
    }
}

// ── Tiers ──────────────────────────────────────────────────────

/// Summary row for the tier list.
#[derive(Debug, Serialize)]
pub struct TierSummary {
    pub tier: TierId,
    pub state: ControllerState,
    pub routing: RoutingTable,
    pub slots: usize,
}

/// An instance slot with its current health.
#[derive(Debug, Serialize)]
pub struct SlotView {
    #[serde(flatten)]
    pub slot: InstanceSlot,
    pub health: HealthStatus,
}

#[derive(Debug, Serialize)]
pub struct TierDetail {
    pub tier: TierId,
    pub state: ControllerState,
    pub routing: RoutingTable,
    pub slots: Vec<SlotView>,
}

fn tier_summary(ctrl: &DeploymentController) -> TierSummary {
    TierSummary {
        tier: ctrl.tier().to_string(),
        state: ctrl.state(),
        routing: ctrl.router().table(),
        slots: ctrl.slots().len(),
    }
}

/// GET /api/v1/tiers
pub async fn list_tiers(State(state): State<ApiState>) -> impl IntoResponse {
    let tiers: Vec<TierSummary> = state
        .pipeline
        .order()
        .iter()
        .filter_map(|tier| state.pipeline.controller(tier))
        .map(tier_summary)
        .collect();
    ApiResponse::ok(tiers)
}

/// GET /api/v1/tiers/{tier}
pub async fn get_tier(State(state): State<ApiState>, Path(tier): Path<String>) -> impl IntoResponse {
    let Some(ctrl) = state.pipeline.controller(&tier) else {
        return error_response("tier not found", StatusCode::NOT_FOUND).into_response();
    };
    let slots = ctrl
        .slots()
        .into_iter()
        .map(|slot| SlotView {
            health: state.registry.status(&slot.id),
            slot,
        })
        .collect();
    ApiResponse::ok(TierDetail {
        tier: ctrl.tier().to_string(),
        state: ctrl.state(),
        routing: ctrl.router().table(),
        slots,
    })
    .into_response()
}

// ── Health ─────────────────────────────────────────────────────

/// GET /api/v1/health
pub async fn health_snapshot(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.snapshot())
}
