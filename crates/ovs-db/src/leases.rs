//! Slot lease rows. The uniqueness constraint on `slot_id` plus `for update`
//! row locks serialize all lease writes per slot.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use ovs_domain::CoreResult;

pub const LEASED: &str = "leased";
pub const RELEASED: &str = "released";
pub const EXPIRED: &str = "expired";

#[derive(Debug, Clone)]
pub struct LeaseRow {
    pub id: i64,
    pub slot_id: String,
    pub run_id: String,
    pub lease_state: String,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LeaseRow {
    /// A lease counts as live while `leased` and unexpired.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.lease_state == LEASED && self.expires_at > now
    }
}

const LEASE_COLUMNS: &str =
    "id, slot_id, run_id, lease_state, leased_at, expires_at, heartbeat_at";

fn map_lease(row: &PgRow) -> CoreResult<LeaseRow> {
    Ok(LeaseRow {
        id: row.try_get("id")?,
        slot_id: row.try_get("slot_id")?,
        run_id: row.try_get("run_id")?,
        lease_state: row.try_get("lease_state")?,
        leased_at: row.try_get("leased_at")?,
        expires_at: row.try_get("expires_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
    })
}

/// Lock every configured slot's lease row for the transaction.
pub async fn lock_leases(
    conn: &mut PgConnection,
    slot_ids: &[String],
) -> CoreResult<Vec<LeaseRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {LEASE_COLUMNS}
        from slot_leases
        where slot_id = any($1)
        order by slot_id
        for update
        "#
    ))
    .bind(slot_ids)
    .fetch_all(&mut *conn)
    .await
    .context("lock_leases failed")?;
    rows.iter().map(map_lease).collect()
}

pub async fn fetch_lease(
    conn: &mut PgConnection,
    slot_id: &str,
) -> CoreResult<Option<LeaseRow>> {
    let row = sqlx::query(&format!(
        "select {LEASE_COLUMNS} from slot_leases where slot_id = $1"
    ))
    .bind(slot_id)
    .fetch_optional(&mut *conn)
    .await
    .context("fetch_lease failed")?;
    row.as_ref().map(map_lease).transpose()
}

pub async fn fetch_lease_for_update(
    conn: &mut PgConnection,
    slot_id: &str,
) -> CoreResult<Option<LeaseRow>> {
    let row = sqlx::query(&format!(
        "select {LEASE_COLUMNS} from slot_leases where slot_id = $1 for update"
    ))
    .bind(slot_id)
    .fetch_optional(&mut *conn)
    .await
    .context("fetch_lease_for_update failed")?;
    row.as_ref().map(map_lease).transpose()
}

/// Lock every lease currently in `leased` state (the reaper's working set).
pub async fn lock_leased(conn: &mut PgConnection) -> CoreResult<Vec<LeaseRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {LEASE_COLUMNS}
        from slot_leases
        where lease_state = 'leased'
        order by slot_id
        for update
        "#
    ))
    .fetch_all(&mut *conn)
    .await
    .context("lock_leased failed")?;
    rows.iter().map(map_lease).collect()
}

/// Create or take over the lease row for a slot.
pub async fn upsert_lease(
    conn: &mut PgConnection,
    slot_id: &str,
    run_id: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> CoreResult<LeaseRow> {
    let row = sqlx::query(&format!(
        r#"
        insert into slot_leases (slot_id, run_id, lease_state, leased_at, expires_at, heartbeat_at)
        values ($1, $2, 'leased', $3, $4, $3)
        on conflict (slot_id)
        do update set run_id = excluded.run_id,
                      lease_state = 'leased',
                      leased_at = excluded.leased_at,
                      expires_at = excluded.expires_at,
                      heartbeat_at = excluded.heartbeat_at
        returning {LEASE_COLUMNS}
        "#
    ))
    .bind(slot_id)
    .bind(run_id)
    .bind(now)
    .bind(expires_at)
    .fetch_one(&mut *conn)
    .await
    .context("upsert_lease failed")?;
    map_lease(&row)
}

pub async fn set_lease_state(
    conn: &mut PgConnection,
    slot_id: &str,
    lease_state: &str,
    expires_at: Option<DateTime<Utc>>,
    heartbeat_at: DateTime<Utc>,
) -> CoreResult<()> {
    match expires_at {
        Some(expires_at) => {
            sqlx::query(
                r#"
                update slot_leases
                   set lease_state = $2, expires_at = $3, heartbeat_at = $4
                 where slot_id = $1
                "#,
            )
            .bind(slot_id)
            .bind(lease_state)
            .bind(expires_at)
            .bind(heartbeat_at)
            .execute(&mut *conn)
            .await
        }
        None => {
            sqlx::query(
                r#"
                update slot_leases
                   set lease_state = $2, heartbeat_at = $3
                 where slot_id = $1
                "#,
            )
            .bind(slot_id)
            .bind(lease_state)
            .bind(heartbeat_at)
            .execute(&mut *conn)
            .await
        }
    }
    .context("set_lease_state failed")?;
    Ok(())
}
