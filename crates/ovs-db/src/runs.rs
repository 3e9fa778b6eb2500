//! Run rows and the queue claim.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use ovs_domain::{CoreError, CoreResult, RunState};

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: String,
    pub title: String,
    pub prompt: String,
    pub status: String,
    pub route: Option<String>,
    pub slot_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub commit_sha: Option<String>,
    pub parent_run_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRow {
    /// Parsed state machine position.
    pub fn state(&self) -> CoreResult<RunState> {
        RunState::parse(&self.status).map_err(CoreError::from)
    }
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub title: String,
    pub prompt: String,
    pub route: Option<String>,
    pub created_by: Option<String>,
    pub parent_run_id: Option<String>,
}

const RUN_COLUMNS: &str = "id, title, prompt, status, route, slot_id, branch_name, \
     worktree_path, commit_sha, parent_run_id, created_by, created_at, updated_at";

fn map_run(row: &PgRow) -> CoreResult<RunRow> {
    Ok(RunRow {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        prompt: row.try_get("prompt")?,
        status: row.try_get("status")?,
        route: row.try_get("route")?,
        slot_id: row.try_get("slot_id")?,
        branch_name: row.try_get("branch_name")?,
        worktree_path: row.try_get("worktree_path")?,
        commit_sha: row.try_get("commit_sha")?,
        parent_run_id: row.try_get("parent_run_id")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a run in `queued` and its context row. Returns the new run.
pub async fn insert_run(conn: &mut PgConnection, new: &NewRun) -> CoreResult<RunRow> {
    let run_id = Uuid::new_v4().to_string();
    let row = sqlx::query(&format!(
        r#"
        insert into runs (id, title, prompt, status, route, created_by, parent_run_id)
        values ($1, $2, $3, $4, $5, $6, $7)
        returning {RUN_COLUMNS}
        "#
    ))
    .bind(&run_id)
    .bind(&new.title)
    .bind(&new.prompt)
    .bind(RunState::Queued.as_str())
    .bind(&new.route)
    .bind(&new.created_by)
    .bind(&new.parent_run_id)
    .fetch_one(&mut *conn)
    .await
    .context("insert_run failed")?;
    map_run(&row)
}

pub async fn fetch_run(conn: &mut PgConnection, run_id: &str) -> CoreResult<Option<RunRow>> {
    let row = sqlx::query(&format!("select {RUN_COLUMNS} from runs where id = $1"))
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await
        .context("fetch_run failed")?;
    row.as_ref().map(map_run).transpose()
}

/// Fetch a run under a row lock for the rest of the transaction.
pub async fn fetch_run_for_update(
    conn: &mut PgConnection,
    run_id: &str,
) -> CoreResult<Option<RunRow>> {
    let row = sqlx::query(&format!(
        "select {RUN_COLUMNS} from runs where id = $1 for update"
    ))
    .bind(run_id)
    .fetch_optional(&mut *conn)
    .await
    .context("fetch_run_for_update failed")?;
    row.as_ref().map(map_run).transpose()
}

/// Lock and return the oldest `queued` run, skipping rows other workers hold.
///
/// `for update skip locked` lets multiple worker loops coexist without
/// double-claims; the row stays locked until the claiming transaction ends.
pub async fn claim_next_queued_run(conn: &mut PgConnection) -> CoreResult<Option<RunRow>> {
    let row = sqlx::query(&format!(
        r#"
        select {RUN_COLUMNS}
        from runs
        where status = 'queued'
        order by created_at asc, id asc
        limit 1
        for update skip locked
        "#
    ))
    .fetch_optional(&mut *conn)
    .await
    .context("claim_next_queued_run failed")?;
    row.as_ref().map(map_run).transpose()
}

pub async fn list_runs(
    conn: &mut PgConnection,
    status: Option<&str>,
    limit: i64,
) -> CoreResult<Vec<RunRow>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                r#"
                select {RUN_COLUMNS} from runs
                where status = $1
                order by created_at desc, id desc
                limit $2
                "#
            ))
            .bind(status)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await
        }
        None => {
            sqlx::query(&format!(
                r#"
                select {RUN_COLUMNS} from runs
                order by created_at desc, id desc
                limit $1
                "#
            ))
            .bind(limit)
            .fetch_all(&mut *conn)
            .await
        }
    }
    .context("list_runs failed")?;
    rows.iter().map(map_run).collect()
}

/// Persist a status change. The caller has already validated the transition
/// and holds the row lock.
pub async fn update_run_status(
    conn: &mut PgConnection,
    run_id: &str,
    status: RunState,
) -> CoreResult<()> {
    sqlx::query("update runs set status = $2, updated_at = now() where id = $1")
        .bind(run_id)
        .bind(status.as_str())
        .execute(&mut *conn)
        .await
        .context("update_run_status failed")?;
    Ok(())
}

pub async fn set_run_slot(
    conn: &mut PgConnection,
    run_id: &str,
    slot_id: Option<&str>,
) -> CoreResult<()> {
    sqlx::query("update runs set slot_id = $2, updated_at = now() where id = $1")
        .bind(run_id)
        .bind(slot_id)
        .execute(&mut *conn)
        .await
        .context("set_run_slot failed")?;
    Ok(())
}

pub async fn set_run_workspace(
    conn: &mut PgConnection,
    run_id: &str,
    slot_id: Option<&str>,
    branch_name: Option<&str>,
    worktree_path: Option<&str>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        update runs
           set slot_id = $2,
               branch_name = $3,
               worktree_path = $4,
               updated_at = now()
         where id = $1
        "#,
    )
    .bind(run_id)
    .bind(slot_id)
    .bind(branch_name)
    .bind(worktree_path)
    .execute(&mut *conn)
    .await
    .context("set_run_workspace failed")?;
    Ok(())
}

pub async fn clear_run_worktree(
    conn: &mut PgConnection,
    run_id: &str,
    slot_id: &str,
    worktree_path: &str,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        update runs
           set slot_id = case when slot_id = $2 then null else slot_id end,
               worktree_path = case when worktree_path = $3 then null else worktree_path end,
               updated_at = now()
         where id = $1
        "#,
    )
    .bind(run_id)
    .bind(slot_id)
    .bind(worktree_path)
    .execute(&mut *conn)
    .await
    .context("clear_run_worktree failed")?;
    Ok(())
}

pub async fn set_run_commit_sha(
    conn: &mut PgConnection,
    run_id: &str,
    commit_sha: &str,
) -> CoreResult<()> {
    sqlx::query("update runs set commit_sha = $2, updated_at = now() where id = $1")
        .bind(run_id)
        .bind(commit_sha)
        .execute(&mut *conn)
        .await
        .context("set_run_commit_sha failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunContextRow {
    pub run_id: String,
    pub route: Option<String>,
    pub page_title: Option<String>,
    pub element_hint: Option<String>,
    pub note: Option<String>,
    pub metadata: Option<Value>,
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_run_context(
    conn: &mut PgConnection,
    run_id: &str,
    route: Option<&str>,
    page_title: Option<&str>,
    element_hint: Option<&str>,
    note: Option<&str>,
    metadata: Option<&Value>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        insert into run_context (run_id, route, page_title, element_hint, note, metadata_json)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(run_id)
    .bind(route)
    .bind(page_title)
    .bind(element_hint)
    .bind(note)
    .bind(metadata)
    .execute(&mut *conn)
    .await
    .context("insert_run_context failed")?;
    Ok(())
}

pub async fn fetch_run_context(
    conn: &mut PgConnection,
    run_id: &str,
) -> CoreResult<Option<RunContextRow>> {
    let row = sqlx::query(
        r#"
        select run_id, route, page_title, element_hint, note, metadata_json
        from run_context
        where run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(&mut *conn)
    .await
    .context("fetch_run_context failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(RunContextRow {
        run_id: row.try_get("run_id")?,
        route: row.try_get("route")?,
        page_title: row.try_get("page_title")?,
        element_hint: row.try_get("element_hint")?,
        note: row.try_get("note")?,
        metadata: row.try_get("metadata_json")?,
    }))
}

/// Merge keys into the context metadata map, creating the row if missing.
pub async fn merge_run_context_metadata(
    conn: &mut PgConnection,
    run_id: &str,
    patch: &Value,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        insert into run_context (run_id, metadata_json)
        values ($1, $2)
        on conflict (run_id)
        do update set metadata_json = coalesce(run_context.metadata_json, '{}'::jsonb) || excluded.metadata_json
        "#,
    )
    .bind(run_id)
    .bind(patch)
    .execute(&mut *conn)
    .await
    .context("merge_run_context_metadata failed")?;
    Ok(())
}

/// Trace id recorded for a run, if any.
pub async fn run_trace_id(conn: &mut PgConnection, run_id: &str) -> CoreResult<Option<String>> {
    let context = fetch_run_context(conn, run_id).await?;
    Ok(context
        .and_then(|c| c.metadata)
        .and_then(|m| m.get("trace_id").and_then(Value::as_str).map(str::to_string)))
}
