//! Event log reads and the SSE stream.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream};
use serde_json::{json, Value};
use sqlx::PgPool;

use ovs_audit::EVENT_SCHEMA_VERSION;
use ovs_db::events::{fetch_events, EventQuery};
use ovs_db::runs;
use ovs_domain::CoreError;

use crate::api_types::{ListEventsQuery, RunEventResponse, StreamEventsQuery};
use crate::error::ApiResult;
use crate::state::AppState;

pub(crate) async fn events_schema() -> Json<Value> {
    Json(json!({
        "version": EVENT_SCHEMA_VERSION,
        "event_fields": [
            "schema_version",
            "id",
            "run_id",
            "event_type",
            "status_from",
            "status_to",
            "payload",
            "created_at",
        ],
        "stream": {
            "path": "/api/runs/{run_id}/events/stream",
            "protocol": "sse",
            "event_name": "run_event",
            "cursor_param": "since_id",
        },
    }))
}

pub(crate) async fn list_run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<ListEventsQuery>,
) -> ApiResult<Json<Vec<RunEventResponse>>> {
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    let rows = fetch_events(
        &mut conn,
        &EventQuery {
            run_id,
            since_id: query.since_id,
            limit: query.limit.unwrap_or(200).clamp(1, 500),
            descending: query.order.as_deref() == Some("desc"),
        },
    )
    .await?;
    Ok(Json(rows.into_iter().map(RunEventResponse::from).collect()))
}

/// Long-polling SSE reader over a run's event log.
///
/// Frames follow `id: <int>` / `event: run_event` / `data: <json>`; idle
/// periods emit comment-only keep-alives. `follow=false` ends the stream
/// once the cursor catches up.
pub(crate) async fn stream_run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<StreamEventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut conn = state.pool.acquire().await.map_err(CoreError::from)?;
    runs::fetch_run(&mut conn, &run_id)
        .await?
        .ok_or_else(|| CoreError::not_found("run_not_found"))?;
    drop(conn);

    let poll_interval =
        Duration::from_secs_f64(query.poll_interval_seconds.unwrap_or(0.75).clamp(0.1, 10.0));
    let heartbeat =
        Duration::from_secs(query.heartbeat_seconds.unwrap_or(15).clamp(5, 120));
    let follow = query.follow.unwrap_or(true);
    let batch_limit = query.batch_limit.unwrap_or(200).clamp(1, 500);

    let stream = event_stream(
        state.pool.clone(),
        run_id,
        query.since_id.unwrap_or(0),
        follow,
        poll_interval,
        batch_limit,
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat")))
}

struct StreamState {
    pool: PgPool,
    run_id: String,
    cursor: i64,
    follow: bool,
    poll_interval: Duration,
    batch_limit: i64,
    buffer: VecDeque<RunEventResponse>,
}

fn event_stream(
    pool: PgPool,
    run_id: String,
    since_id: i64,
    follow: bool,
    poll_interval: Duration,
    batch_limit: i64,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = StreamState {
        pool,
        run_id,
        cursor: since_id,
        follow,
        poll_interval,
        batch_limit,
        buffer: VecDeque::new(),
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.buffer.pop_front() {
                let frame = sse_frame(&event);
                return Some((Ok(frame), st));
            }

            let batch = next_batch(&mut st).await;
            match batch {
                Ok(rows) if rows.is_empty() => {
                    if !st.follow {
                        return None;
                    }
                    tokio::time::sleep(st.poll_interval).await;
                }
                Ok(rows) => {
                    for row in rows {
                        st.cursor = st.cursor.max(row.id);
                        st.buffer.push_back(row);
                    }
                }
                // A failing poll ends the stream; the client resumes from
                // its last seen id.
                Err(_) => return None,
            }
        }
    })
}

async fn next_batch(st: &mut StreamState) -> Result<Vec<RunEventResponse>, CoreError> {
    let mut conn = st.pool.acquire().await.map_err(CoreError::from)?;
    let rows = fetch_events(
        &mut conn,
        &EventQuery {
            run_id: st.run_id.clone(),
            since_id: Some(st.cursor),
            limit: st.batch_limit,
            descending: false,
        },
    )
    .await?;
    Ok(rows.into_iter().map(RunEventResponse::from).collect())
}

fn sse_frame(event: &RunEventResponse) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .id(event.id.to_string())
        .event("run_event")
        .data(data)
}
