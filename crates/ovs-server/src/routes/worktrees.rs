//! Worktree binding endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::Value;

use ovs_domain::CoreError;
use ovs_worktree::{AssignOutcome, CleanupOutcome, WorktreeBindingState};

use crate::api_types::{AssignWorktreeRequest, CleanupWorktreeRequest};
use crate::error::ApiResult;
use crate::state::AppState;

pub(crate) async fn get_worktree_bindings(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<WorktreeBindingState>>> {
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    let rows = state.worktrees.list_bindings(&mut conn).await?;
    Ok(Json(rows))
}

pub(crate) async fn assign_worktree(
    State(state): State<AppState>,
    Json(body): Json<AssignWorktreeRequest>,
) -> ApiResult<Json<AssignOutcome>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let outcome = state
        .worktrees
        .assign(&mut tx, &body.run_id, &body.slot_id)
        .await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(outcome))
}

pub(crate) async fn cleanup_worktree(
    State(state): State<AppState>,
    Path(slot_id): Path<String>,
    Json(body): Json<CleanupWorktreeRequest>,
) -> ApiResult<Json<CleanupOutcome>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let outcome = state
        .worktrees
        .cleanup(&mut tx, &slot_id, body.run_id.as_deref())
        .await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(outcome))
}

pub(crate) async fn worktree_contract() -> Json<Value> {
    Json(ovs_worktree::worktree_contract())
}
