//! Approval endpoints: the merge-gate pipeline entry points.

use axum::extract::{Path, State};
use axum::Json;

use ovs_db::records::list_approvals;
use ovs_domain::{CoreError, FailureReasonCode};

use crate::api_types::{ApprovalResponse, ApproveRequest, RejectRequest};
use crate::error::ApiResult;
use crate::state::AppState;

pub(crate) async fn list_run_approvals(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Vec<ApprovalResponse>>> {
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    let rows = list_approvals(&mut conn, &run_id).await?;
    Ok(Json(rows.into_iter().map(ApprovalResponse::from).collect()))
}

/// Approve and drive the full merge-gate pipeline. The transaction holds a
/// row lock on the run until the pipeline commits.
pub(crate) async fn approve_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<ApproveRequest>,
) -> ApiResult<Json<ApprovalResponse>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let approval = state
        .gate
        .approve(
            &mut tx,
            &run_id,
            body.reviewer_id.as_deref(),
            body.reason.as_deref(),
        )
        .await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(approval.into()))
}

pub(crate) async fn reject_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<RejectRequest>,
) -> ApiResult<Json<ApprovalResponse>> {
    let failure_reason = match body.failure_reason_code.as_deref() {
        None => FailureReasonCode::PolicyRejected,
        Some(raw) => FailureReasonCode::parse(raw).map_err(|_| {
            CoreError::ValidationError(format!("invalid_failure_reason_code:{raw}"))
        })?,
    };

    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let approval = state
        .gate
        .reject(
            &mut tx,
            &run_id,
            body.reviewer_id.as_deref(),
            &body.reason,
            failure_reason,
        )
        .await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(approval.into()))
}
