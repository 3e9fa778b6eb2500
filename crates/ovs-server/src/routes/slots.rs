//! Slot lease endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::Value;

use ovs_domain::CoreError;
use ovs_slots::{AcquireOutcome, HeartbeatOutcome, ReapOutcome, ReleaseOutcome, SlotState};

use crate::api_types::{AcquireSlotRequest, HeartbeatSlotRequest, ReleaseSlotRequest};
use crate::error::ApiResult;
use crate::state::AppState;

pub(crate) async fn get_slots(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<SlotState>>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let states = state.leases.list_states(&mut tx).await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(states))
}

pub(crate) async fn acquire_slot(
    State(state): State<AppState>,
    Json(body): Json<AcquireSlotRequest>,
) -> ApiResult<Json<AcquireOutcome>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let outcome = state.leases.acquire(&mut tx, &body.run_id).await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(outcome))
}

pub(crate) async fn release_slot(
    State(state): State<AppState>,
    Path(slot_id): Path<String>,
    Json(body): Json<ReleaseSlotRequest>,
) -> ApiResult<Json<ReleaseOutcome>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let outcome = state
        .leases
        .release(&mut tx, &slot_id, body.run_id.as_deref())
        .await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(outcome))
}

pub(crate) async fn heartbeat_slot(
    State(state): State<AppState>,
    Path(slot_id): Path<String>,
    Json(body): Json<HeartbeatSlotRequest>,
) -> ApiResult<Json<HeartbeatOutcome>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let outcome = state
        .leases
        .heartbeat(&mut tx, &slot_id, &body.run_id)
        .await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(outcome))
}

pub(crate) async fn reap_expired(
    State(state): State<AppState>,
) -> ApiResult<Json<ReapOutcome>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let outcome = state.leases.reap_expired(&mut tx).await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(outcome))
}

pub(crate) async fn slot_contract(State(state): State<AppState>) -> Json<Value> {
    Json(ovs_slots::slot_contract(state.leases.slot_ids()))
}
