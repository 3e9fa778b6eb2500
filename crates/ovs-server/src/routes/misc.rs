//! Health, checks, metrics, and release endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use ovs_db::records::{fetch_release, list_checks, list_releases as db_list_releases};
use ovs_domain::CoreError;

use crate::api_types::{
    LimitQuery, ListReleasesQuery, ReleaseResponse, ValidationCheckResponse,
};
use crate::error::ApiResult;
use crate::state::AppState;

pub(crate) async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub(crate) async fn list_run_checks(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<ValidationCheckResponse>>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 300);
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    let rows = list_checks(&mut conn, &run_id, limit).await?;
    Ok(Json(rows.into_iter().map(ValidationCheckResponse::from).collect()))
}

pub(crate) async fn core_metrics(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let metrics = ovs_db::collect_core_metrics(&state.pool)
        .await
        .map_err(CoreError::Internal)?;
    Ok(Json(json!({
        "observed_at": Utc::now().to_rfc3339(),
        "queue_depth": metrics.queue_depth,
        "duration_seconds": {
            "avg": (metrics.avg_duration_seconds * 1000.0).round() / 1000.0,
            "max": (metrics.max_duration_seconds * 1000.0).round() / 1000.0,
            "sample_size": metrics.terminal_runs,
        },
        "failure_rate": (metrics.failure_rate * 1_000_000.0).round() / 1_000_000.0,
        "failed_runs": metrics.failed_runs,
        "terminal_runs": metrics.terminal_runs,
    })))
}

pub(crate) async fn list_releases(
    State(state): State<AppState>,
    Query(query): Query<ListReleasesQuery>,
) -> ApiResult<Json<Vec<ReleaseResponse>>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    let rows = db_list_releases(&mut conn, query.status.as_deref(), limit).await?;
    Ok(Json(rows.into_iter().map(ReleaseResponse::from).collect()))
}

pub(crate) async fn get_release(
    State(state): State<AppState>,
    Path(release_id): Path<String>,
) -> ApiResult<Json<ReleaseResponse>> {
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    let release = fetch_release(&mut conn, &release_id)
        .await?
        .ok_or_else(|| CoreError::not_found("release_not_found"))?;
    Ok(Json(release.into()))
}
