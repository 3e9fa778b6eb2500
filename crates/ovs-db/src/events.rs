//! The append-only run event log and its audit-log companion.
//!
//! `append_run_event` is the only write path for both tables. Events are
//! appended on the caller's connection so a status change, its event, and its
//! audit row commit atomically.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use ovs_audit::{normalize_event_payload, payload_hash};
use ovs_domain::CoreResult;

#[derive(Debug, Clone)]
pub struct RunEventRow {
    pub id: i64,
    pub run_id: String,
    pub event_type: String,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Everything `append_run_event` needs; `audit_action` opts into an atomic
/// audit-log row.
#[derive(Debug, Clone, Default)]
pub struct NewRunEvent {
    pub run_id: String,
    pub event_type: String,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
    pub payload: Option<Value>,
    pub actor_id: Option<String>,
    pub audit_action: Option<String>,
}

impl NewRunEvent {
    pub fn new(run_id: &str, event_type: &str) -> Self {
        NewRunEvent {
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            ..NewRunEvent::default()
        }
    }

    pub fn with_transition(mut self, from: &str, to: &str) -> Self {
        self.status_from = Some(from.to_string());
        self.status_to = Some(to.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_actor(mut self, actor_id: Option<&str>) -> Self {
        self.actor_id = actor_id.map(str::to_string);
        self
    }

    pub fn with_audit(mut self, action: &str) -> Self {
        self.audit_action = Some(action.to_string());
        self
    }
}

fn map_event(row: &PgRow) -> CoreResult<RunEventRow> {
    Ok(RunEventRow {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        event_type: row.try_get("event_type")?,
        status_from: row.try_get("status_from")?,
        status_to: row.try_get("status_to")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Append one run event, normalizing `schema_version` into the payload, and
/// atomically append an audit row when `audit_action` is set.
pub async fn append_run_event(
    conn: &mut PgConnection,
    event: NewRunEvent,
) -> CoreResult<RunEventRow> {
    let payload = normalize_event_payload(event.payload);

    let row = sqlx::query(
        r#"
        insert into run_events (run_id, event_type, status_from, status_to, payload)
        values ($1, $2, $3, $4, $5)
        returning id, run_id, event_type, status_from, status_to, payload, created_at
        "#,
    )
    .bind(&event.run_id)
    .bind(&event.event_type)
    .bind(&event.status_from)
    .bind(&event.status_to)
    .bind(&payload)
    .fetch_one(&mut *conn)
    .await
    .context("append_run_event failed")?;
    let appended = map_event(&row)?;

    if let Some(action) = &event.audit_action {
        let mut audit_payload = serde_json::Map::new();
        audit_payload.insert("schema_version".into(), payload["schema_version"].clone());
        audit_payload.insert("run_id".into(), Value::from(event.run_id.clone()));
        audit_payload.insert("event_type".into(), Value::from(event.event_type.clone()));
        audit_payload.insert("event_id".into(), Value::from(appended.id));
        audit_payload.insert(
            "status_from".into(),
            event.status_from.clone().map(Value::from).unwrap_or(Value::Null),
        );
        audit_payload.insert(
            "status_to".into(),
            event.status_to.clone().map(Value::from).unwrap_or(Value::Null),
        );
        audit_payload.insert("payload".into(), payload.clone());
        append_audit_log(
            conn,
            action,
            &Value::Object(audit_payload),
            event.actor_id.as_deref(),
        )
        .await?;
    }

    Ok(appended)
}

/// Append one audit-log row carrying the canonical hash of its payload.
pub async fn append_audit_log(
    conn: &mut PgConnection,
    action: &str,
    payload: &Value,
    actor_id: Option<&str>,
) -> CoreResult<i64> {
    let hash = payload_hash(payload);
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into audit_log (actor_id, action, payload_hash, payload_json)
        values ($1, $2, $3, $4)
        returning id
        "#,
    )
    .bind(actor_id)
    .bind(action)
    .bind(hash)
    .bind(payload)
    .fetch_one(&mut *conn)
    .await
    .context("append_audit_log failed")?;
    Ok(id)
}

/// Cursor query over a run's events.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub run_id: String,
    pub since_id: Option<i64>,
    pub limit: i64,
    pub descending: bool,
}

impl EventQuery {
    pub fn new(run_id: &str) -> Self {
        EventQuery {
            run_id: run_id.to_string(),
            since_id: None,
            limit: 200,
            descending: false,
        }
    }
}

pub async fn fetch_events(
    conn: &mut PgConnection,
    query: &EventQuery,
) -> CoreResult<Vec<RunEventRow>> {
    let order = if query.descending { "desc" } else { "asc" };
    let sql = format!(
        r#"
        select id, run_id, event_type, status_from, status_to, payload, created_at
        from run_events
        where run_id = $1 and id > $2
        order by id {order}
        limit $3
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(&query.run_id)
        .bind(query.since_id.unwrap_or(0))
        .bind(query.limit)
        .fetch_all(&mut *conn)
        .await
        .context("fetch_events failed")?;
    rows.iter().map(map_event).collect()
}

/// Latest `status_transition` event for a run, newest first.
pub async fn last_status_transition(
    conn: &mut PgConnection,
    run_id: &str,
) -> CoreResult<Option<RunEventRow>> {
    let row = sqlx::query(
        r#"
        select id, run_id, event_type, status_from, status_to, payload, created_at
        from run_events
        where run_id = $1 and event_type = 'status_transition'
        order by id desc
        limit 1
        "#,
    )
    .bind(run_id)
    .fetch_optional(&mut *conn)
    .await
    .context("last_status_transition failed")?;
    row.as_ref().map(map_event).transpose()
}
