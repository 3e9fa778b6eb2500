//! PostgreSQL persistence for the Overseer control plane.
//!
//! All row types are mapped by hand (`try_get`) and every mutating function
//! takes a `&mut PgConnection` so callers decide transaction boundaries.
//! Cross-component coordination happens through row locks here, never through
//! in-memory mutexes.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

pub mod bindings;
pub mod events;
pub mod leases;
pub mod records;
pub mod runs;

pub use events::{append_audit_log, append_run_event, EventQuery, NewRunEvent, RunEventRow};
pub use runs::{NewRun, RunRow};

/// Connect to Postgres using an explicit connection string.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

pub const ENV_DB_URL: &str = "DATABASE_URL";

/// Connect using `DATABASE_URL` from the environment.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='runs'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_runs_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_runs_table: bool,
}

/// Queue depth + terminal stats for `/api/metrics/core`.
pub async fn collect_core_metrics(pool: &PgPool) -> Result<CoreMetrics> {
    let (queue_depth,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select count(*)::bigint
        from runs
        where status in ('queued', 'planning', 'editing', 'testing')
        "#,
    )
    .fetch_one(pool)
    .await
    .context("queue depth query failed")?;

    let rows = sqlx::query(
        r#"
        select status, extract(epoch from (updated_at - created_at))::float8 as duration_seconds
        from runs
        where status in ('merged', 'failed', 'canceled', 'expired')
        "#,
    )
    .fetch_all(pool)
    .await
    .context("terminal runs query failed")?;

    let mut durations: Vec<f64> = Vec::with_capacity(rows.len());
    let mut failed_runs = 0i64;
    for row in &rows {
        let status: String = row.try_get("status")?;
        if status == "failed" {
            failed_runs += 1;
        }
        let duration: f64 = row.try_get("duration_seconds")?;
        durations.push(duration.max(0.0));
    }

    let terminal_runs = durations.len() as i64;
    let avg = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };
    let max = durations.iter().cloned().fold(0.0f64, f64::max);

    Ok(CoreMetrics {
        queue_depth,
        terminal_runs,
        failed_runs,
        failure_rate: if terminal_runs > 0 {
            failed_runs as f64 / terminal_runs as f64
        } else {
            0.0
        },
        avg_duration_seconds: avg,
        max_duration_seconds: max,
    })
}

#[derive(Debug, Clone)]
pub struct CoreMetrics {
    pub queue_depth: i64,
    pub terminal_runs: i64,
    pub failed_runs: i64,
    pub failure_rate: f64,
    pub avg_duration_seconds: f64,
    pub max_duration_seconds: f64,
}
