//! Run lifecycle endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::{json, Value};

use ovs_db::events::{append_run_event, last_status_transition, NewRunEvent};
use ovs_db::runs;
use ovs_domain::{
    ensure_transition_allowed, list_failure_reason_codes, list_run_states,
    recoverable_payload_fields, CoreError, CoreResult, FailureReasonCode, RunState,
};

use crate::api_types::{
    CreateRunRequest, ListRunsQuery, RunResponse, TransitionRunRequest,
};
use crate::error::ApiResult;
use crate::state::AppState;

pub(crate) async fn run_contract() -> Json<Value> {
    Json(json!({
        "states": list_run_states(),
        "failure_reason_codes": list_failure_reason_codes(),
    }))
}

pub(crate) async fn create_run(
    State(state): State<AppState>,
    Json(body): Json<CreateRunRequest>,
) -> ApiResult<Json<RunResponse>> {
    if body.title.trim().is_empty() || body.prompt.trim().is_empty() {
        return Err(CoreError::ValidationError("title_and_prompt_required".to_string()).into());
    }

    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let run = runs::insert_run(
        &mut tx,
        &runs::NewRun {
            title: body.title.clone(),
            prompt: body.prompt.clone(),
            route: body.route.clone(),
            created_by: body.created_by.clone(),
            parent_run_id: None,
        },
    )
    .await?;
    runs::insert_run_context(
        &mut tx,
        &run.id,
        body.route.as_deref(),
        body.page_title.as_deref(),
        body.element_hint.as_deref(),
        body.note.as_deref(),
        body.metadata.as_ref(),
    )
    .await?;
    append_run_event(
        &mut tx,
        NewRunEvent::new(&run.id, "run_created")
            .with_payload(json!({"source": "api"}))
            .with_actor(body.created_by.as_deref())
            .with_audit("run.created"),
    )
    .await?;
    tx.commit().await.map_err(CoreError::from)?;

    Ok(Json(run.into()))
}

pub(crate) async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<RunResponse>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    let rows = runs::list_runs(&mut conn, query.status.as_deref(), limit).await?;
    Ok(Json(rows.into_iter().map(RunResponse::from).collect()))
}

pub(crate) async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunResponse>> {
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    let run = runs::fetch_run(&mut conn, &run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("run_not_found"))?;
    Ok(Json(run.into()))
}

pub(crate) async fn transition_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<TransitionRunRequest>,
) -> ApiResult<Json<RunResponse>> {
    let target = RunState::parse(&body.to_status)
        .map_err(|_| CoreError::ValidationError(format!("invalid_status:{}", body.to_status)))?;
    let failure_reason = body
        .failure_reason_code
        .as_deref()
        .map(|raw| {
            FailureReasonCode::parse(raw).map_err(|_| {
                CoreError::ValidationError(format!("invalid_failure_reason_code:{raw}"))
            })
        })
        .transpose()?;

    let run = apply_transition(&state, &run_id, target, failure_reason, "api").await?;
    Ok(Json(run.into()))
}

pub(crate) async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunResponse>> {
    let run = apply_transition(&state, &run_id, RunState::Canceled, None, "api").await?;
    Ok(Json(run.into()))
}

/// Thin wrapper over the same transition-to-expired pipeline the lease
/// reaper uses: recoverable metadata attached, slot released.
pub(crate) async fn expire_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunResponse>> {
    let run = apply_transition(&state, &run_id, RunState::Expired, None, "api").await?;
    Ok(Json(run.into()))
}

pub(crate) async fn retry_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunResponse>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let parent = runs::fetch_run(&mut tx, &run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("run_not_found"))?;

    let child = spawn_child_run(&mut tx, &parent, "run_retried", None).await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(child.into()))
}

/// Create a child run from a recoverable terminal failure. Only runs whose
/// final transition carried `recoverable=true` qualify.
pub(crate) async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunResponse>> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let parent = runs::fetch_run(&mut tx, &run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("run_not_found"))?;

    let parent_state = parent.state()?;
    if !parent_state.is_terminal() {
        return Err(CoreError::PreconditionViolated("run_not_terminal".to_string()).into());
    }

    let last = last_status_transition(&mut tx, &parent.id).await?;
    let payload = last.and_then(|event| event.payload);
    let recoverable = payload
        .as_ref()
        .and_then(|p| p.get("recoverable"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !recoverable {
        return Err(CoreError::PreconditionViolated("run_not_recoverable".to_string()).into());
    }
    let recovery_reason_code = payload
        .as_ref()
        .and_then(|p| {
            p.get("failure_reason_code")
                .or_else(|| p.get("reason"))
                .and_then(Value::as_str)
        })
        .unwrap_or(FailureReasonCode::PreviewExpired.as_str())
        .to_string();

    let child = spawn_child_run(&mut tx, &parent, "run_resumed", Some(&recovery_reason_code))
        .await?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(Json(child.into()))
}

/// Create a child run in `queued` copying the parent's prompt and context.
async fn spawn_child_run(
    conn: &mut sqlx::PgConnection,
    parent: &ovs_db::RunRow,
    event_type: &str,
    recovery_reason_code: Option<&str>,
) -> CoreResult<ovs_db::RunRow> {
    let title_prefix = if event_type == "run_resumed" { "Resume" } else { "Retry" };
    let child = runs::insert_run(
        conn,
        &runs::NewRun {
            title: format!("{title_prefix}: {}", parent.title),
            prompt: parent.prompt.clone(),
            route: parent.route.clone(),
            created_by: parent.created_by.clone(),
            parent_run_id: Some(parent.id.clone()),
        },
    )
    .await?;

    // Carry the parent's context forward, minus its trace id.
    if let Some(context) = runs::fetch_run_context(conn, &parent.id).await? {
        let metadata = context.metadata.map(|mut value| {
            if let Some(map) = value.as_object_mut() {
                map.remove("trace_id");
            }
            value
        });
        runs::insert_run_context(
            conn,
            &child.id,
            context.route.as_deref(),
            context.page_title.as_deref(),
            context.element_hint.as_deref(),
            context.note.as_deref(),
            metadata.as_ref(),
        )
        .await?;
    }

    let mut payload = serde_json::Map::new();
    payload.insert("parent_run_id".into(), json!(parent.id));
    if let Some(code) = recovery_reason_code {
        payload.insert("recovery_reason_code".into(), json!(code));
    }
    append_run_event(
        conn,
        NewRunEvent::new(&child.id, event_type)
            .with_payload(Value::Object(payload))
            .with_actor(parent.created_by.as_deref())
            .with_audit("run.created"),
    )
    .await?;

    Ok(child)
}

/// Lock the run, validate and apply one transition, append the event, and
/// release any held slot lease when the target is terminal. A terminal run
/// must not keep a `leased` slot; the lease is freed here, not left to the
/// TTL reaper.
pub(crate) async fn apply_transition(
    state: &AppState,
    run_id: &str,
    target: RunState,
    failure_reason: Option<FailureReasonCode>,
    source: &str,
) -> ApiResult<ovs_db::RunRow> {
    let mut tx = state.pool.begin().await.map_err(CoreError::from)?;
    let run = runs::fetch_run_for_update(&mut tx, run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("run_not_found"))?;
    let current = run.state()?;

    ensure_transition_allowed(current, target, failure_reason).map_err(CoreError::from)?;
    runs::update_run_status(&mut tx, run_id, target).await?;

    let mut payload = serde_json::Map::new();
    payload.insert("source".into(), json!(source));
    if let Some(reason) = failure_reason {
        payload.insert("failure_reason_code".into(), json!(reason.as_str()));
        if reason.is_recoverable() {
            for (key, value) in recoverable_payload_fields(run_id, reason) {
                payload.insert(key.to_string(), value);
            }
        }
    }
    if target == RunState::Expired {
        payload.insert("reason".into(), json!(FailureReasonCode::PreviewExpired.as_str()));
        for (key, value) in
            recoverable_payload_fields(run_id, FailureReasonCode::PreviewExpired)
        {
            payload.insert(key.to_string(), value);
        }
    }

    append_run_event(
        &mut tx,
        NewRunEvent::new(run_id, "status_transition")
            .with_transition(current.as_str(), target.as_str())
            .with_payload(Value::Object(payload))
            .with_audit("run.status.transition"),
    )
    .await?;

    if target.is_terminal() {
        if let Some(slot_id) = &run.slot_id {
            let released = state.leases.release(&mut tx, slot_id, Some(run_id)).await?;
            if !released.released {
                append_run_event(
                    &mut tx,
                    NewRunEvent::new(run_id, "slot_release_skipped").with_payload(json!({
                        "source": source,
                        "slot_id": slot_id,
                        "reason": released.reason,
                    })),
                )
                .await?;
            }
        }
    }

    let updated = runs::fetch_run(&mut tx, run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("run_not_found"))?;
    tx.commit().await.map_err(CoreError::from)?;
    Ok(updated)
}
