//! Slot/worktree binding rows, one per slot.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use ovs_domain::CoreResult;

pub const ACTIVE: &str = "active";
pub const RELEASED: &str = "released";

#[derive(Debug, Clone)]
pub struct BindingRow {
    pub id: i64,
    pub slot_id: String,
    pub run_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub binding_state: String,
    pub last_action: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewBinding {
    pub slot_id: String,
    pub run_id: String,
    pub branch_name: String,
    pub worktree_path: String,
    pub last_action: String,
}

const BINDING_COLUMNS: &str = "id, slot_id, run_id, branch_name, worktree_path, binding_state, \
     last_action, created_at, updated_at, released_at";

fn map_binding(row: &PgRow) -> CoreResult<BindingRow> {
    Ok(BindingRow {
        id: row.try_get("id")?,
        slot_id: row.try_get("slot_id")?,
        run_id: row.try_get("run_id")?,
        branch_name: row.try_get("branch_name")?,
        worktree_path: row.try_get("worktree_path")?,
        binding_state: row.try_get("binding_state")?,
        last_action: row.try_get("last_action")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        released_at: row.try_get("released_at")?,
    })
}

pub async fn fetch_binding_for_update(
    conn: &mut PgConnection,
    slot_id: &str,
) -> CoreResult<Option<BindingRow>> {
    let row = sqlx::query(&format!(
        "select {BINDING_COLUMNS} from slot_worktree_bindings where slot_id = $1 for update"
    ))
    .bind(slot_id)
    .fetch_optional(&mut *conn)
    .await
    .context("fetch_binding_for_update failed")?;
    row.as_ref().map(map_binding).transpose()
}

/// Create or take over the binding row for a slot, marking it active.
pub async fn upsert_binding(conn: &mut PgConnection, new: &NewBinding) -> CoreResult<BindingRow> {
    let row = sqlx::query(&format!(
        r#"
        insert into slot_worktree_bindings
            (slot_id, run_id, branch_name, worktree_path, binding_state, last_action)
        values ($1, $2, $3, $4, 'active', $5)
        on conflict (slot_id)
        do update set run_id = excluded.run_id,
                      branch_name = excluded.branch_name,
                      worktree_path = excluded.worktree_path,
                      binding_state = 'active',
                      last_action = excluded.last_action,
                      updated_at = now(),
                      released_at = null
        returning {BINDING_COLUMNS}
        "#
    ))
    .bind(&new.slot_id)
    .bind(&new.run_id)
    .bind(&new.branch_name)
    .bind(&new.worktree_path)
    .bind(&new.last_action)
    .fetch_one(&mut *conn)
    .await
    .context("upsert_binding failed")?;
    map_binding(&row)
}

pub async fn release_binding(
    conn: &mut PgConnection,
    slot_id: &str,
    last_action: &str,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        update slot_worktree_bindings
           set binding_state = 'released',
               last_action = $2,
               updated_at = now(),
               released_at = now()
         where slot_id = $1
        "#,
    )
    .bind(slot_id)
    .bind(last_action)
    .execute(&mut *conn)
    .await
    .context("release_binding failed")?;
    Ok(())
}

pub async fn list_bindings(
    conn: &mut PgConnection,
    slot_ids: &[String],
) -> CoreResult<Vec<BindingRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {BINDING_COLUMNS}
        from slot_worktree_bindings
        where slot_id = any($1)
        order by slot_id asc
        "#
    ))
    .bind(slot_ids)
    .fetch_all(&mut *conn)
    .await
    .context("list_bindings failed")?;
    rows.iter().map(map_binding).collect()
}
