//! Artifact listing and allowlisted content serving.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;

use ovs_artifacts::{artifact_path_from_uri, guess_mime_type, is_within_roots};
use ovs_db::records::{artifact_uri_linked, list_artifacts};
use ovs_db::runs;
use ovs_domain::CoreError;

use crate::api_types::{ArtifactContentQuery, LimitQuery, RunArtifactResponse};
use crate::error::ApiResult;
use crate::state::AppState;

pub(crate) async fn list_run_artifacts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<RunArtifactResponse>>> {
    let limit = query.limit.unwrap_or(200).clamp(1, 500);
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    let rows = list_artifacts(&mut conn, &run_id, limit).await?;
    Ok(Json(rows.into_iter().map(RunArtifactResponse::from).collect()))
}

/// Serve artifact bytes. The URI must be linked to the run through an
/// artifact or check row and must resolve under a configured artifact root.
pub(crate) async fn get_artifact_content(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<ArtifactContentQuery>,
) -> ApiResult<Response> {
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    runs::fetch_run(&mut conn, &run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("run_not_found"))?;

    if !artifact_uri_linked(&mut conn, &run_id, &query.uri).await? {
        return Err(CoreError::not_found("artifact_not_linked_to_run").into());
    }
    drop(conn);

    let path = artifact_path_from_uri(&query.uri)
        .ok_or_else(|| CoreError::ValidationError("unsupported_artifact_uri".to_string()))?;
    if !path.is_file() {
        return Err(CoreError::not_found("artifact_file_not_found").into());
    }

    let roots = vec![state.settings.worker.artifact_root.clone()];
    if !is_within_roots(&path, &roots) {
        return Err(CoreError::ArtifactPathDenied("artifact_path_not_allowed".to_string()).into());
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|err| CoreError::Internal(anyhow::Error::new(err).context("read artifact")))?;
    let mime = guess_mime_type(&path);
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}
