//! REST API handlers for the datastore replica router.
//!
//! Every endpoint answers 404 when no datastore is configured.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use shiftgrid_routing::{ReplicaError, ReplicaRouter};
use shiftgrid_state::{DatastoreNode, NodeId};

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

fn replica_status(err: &ReplicaError) -> StatusCode {
    match err {
        ReplicaError::UnknownNode(_) => StatusCode::NOT_FOUND,
        ReplicaError::AlreadyPrimary(_) | ReplicaError::NotHealthy(_) => StatusCode::CONFLICT,
        ReplicaError::PrimaryUnreachable(_) | ReplicaError::NoHealthyReplica => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ReplicaError::Topology(_) | ReplicaError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn replica(state: &ApiState) -> Option<&Arc<ReplicaRouter>> {
    state.replica.as_ref()
}

fn not_configured() -> axum::response::Response {
    error_response("no datastore configured", StatusCode::NOT_FOUND).into_response()
}

/// Datastore overview.
#[derive(Debug, Serialize)]
pub struct DatastoreView {
    pub primary: NodeId,
    /// Where writes go right now; absent while the primary is unreachable.
    pub write_target: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_error: Option<String>,
    pub nodes: Vec<DatastoreNode>,
}

/// GET /api/v1/datastore
pub async fn get_datastore(State(state): State<ApiState>) -> impl IntoResponse {
    let Some(replica) = replica(&state) else {
        return not_configured();
    };
    let (write_target, write_error) = match replica.write_target() {
        Ok(node) => (Some(node), None),
        Err(e) => (None, Some(e.to_string())),
    };
    ApiResponse::ok(DatastoreView {
        primary: replica.primary(),
        write_target,
        write_error,
        nodes: replica.nodes(),
    })
    .into_response()
}

/// GET /api/v1/datastore/history
pub async fn role_history(State(state): State<ApiState>) -> impl IntoResponse {
    match replica(&state) {
        Some(replica) => ApiResponse::ok(replica.history()).into_response(),
        None => not_configured(),
    }
}

/// POST /api/v1/datastore/{node}/promote
pub async fn promote_node(
    State(state): State<ApiState>,
    Path(node): Path<String>,
) -> impl IntoResponse {
    let Some(replica) = replica(&state) else {
        return not_configured();
    };
    match replica.promote(&node) {
        Ok(event) => ApiResponse::ok(event).into_response(),
        Err(e) => error_response(&e.to_string(), replica_status(&e)).into_response(),
    }
}

/// Lag report body.
#[derive(Debug, Deserialize)]
pub struct LagReport {
    pub lag: u64,
}

/// POST /api/v1/datastore/{node}/lag
pub async fn report_lag(
    State(state): State<ApiState>,
    Path(node): Path<String>,
    Json(report): Json<LagReport>,
) -> impl IntoResponse {
    let Some(replica) = replica(&state) else {
        return not_configured();
    };
    match replica.report_lag(&node, report.lag) {
        Ok(()) => ApiResponse::ok(report.lag).into_response(),
        Err(e) => error_response(&e.to_string(), replica_status(&e)).into_response(),
    }
}
