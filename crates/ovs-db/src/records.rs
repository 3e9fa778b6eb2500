//! Append-only side tables: validation checks, artifacts, approvals,
//! releases, preview DB resets.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use ovs_domain::CoreResult;

// ---------------------------------------------------------------------------
// Validation checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ValidationCheckRow {
    pub id: i64,
    pub run_id: String,
    pub check_name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub artifact_uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCheck {
    pub run_id: String,
    pub check_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub artifact_uri: Option<String>,
}

pub async fn insert_check(conn: &mut PgConnection, new: &NewCheck) -> CoreResult<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into validation_checks (run_id, check_name, status, started_at, ended_at, artifact_uri)
        values ($1, $2, $3, $4, $5, $6)
        returning id
        "#,
    )
    .bind(&new.run_id)
    .bind(&new.check_name)
    .bind(&new.status)
    .bind(new.started_at)
    .bind(new.ended_at)
    .bind(&new.artifact_uri)
    .fetch_one(&mut *conn)
    .await
    .context("insert_check failed")?;
    Ok(id)
}

pub async fn list_checks(
    conn: &mut PgConnection,
    run_id: &str,
    limit: i64,
) -> CoreResult<Vec<ValidationCheckRow>> {
    let rows = sqlx::query(
        r#"
        select id, run_id, check_name, status, started_at, ended_at, artifact_uri
        from validation_checks
        where run_id = $1
        order by id asc
        limit $2
        "#,
    )
    .bind(run_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await
    .context("list_checks failed")?;

    rows.iter()
        .map(|row| {
            Ok(ValidationCheckRow {
                id: row.try_get("id")?,
                run_id: row.try_get("run_id")?,
                check_name: row.try_get("check_name")?,
                status: row.try_get("status")?,
                started_at: row.try_get("started_at")?,
                ended_at: row.try_get("ended_at")?,
                artifact_uri: row.try_get("artifact_uri")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Run artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunArtifactRow {
    pub id: i64,
    pub run_id: String,
    pub artifact_type: String,
    pub artifact_uri: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub run_id: String,
    pub artifact_type: String,
    pub artifact_uri: String,
    pub metadata: Option<Value>,
}

pub async fn insert_artifact(conn: &mut PgConnection, new: &NewArtifact) -> CoreResult<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into run_artifacts (run_id, artifact_type, artifact_uri, metadata_json)
        values ($1, $2, $3, $4)
        returning id
        "#,
    )
    .bind(&new.run_id)
    .bind(&new.artifact_type)
    .bind(&new.artifact_uri)
    .bind(&new.metadata)
    .fetch_one(&mut *conn)
    .await
    .context("insert_artifact failed")?;
    Ok(id)
}

pub async fn list_artifacts(
    conn: &mut PgConnection,
    run_id: &str,
    limit: i64,
) -> CoreResult<Vec<RunArtifactRow>> {
    let rows = sqlx::query(
        r#"
        select id, run_id, artifact_type, artifact_uri, metadata_json, created_at
        from run_artifacts
        where run_id = $1
        order by id asc
        limit $2
        "#,
    )
    .bind(run_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await
    .context("list_artifacts failed")?;

    rows.iter()
        .map(|row| {
            Ok(RunArtifactRow {
                id: row.try_get("id")?,
                run_id: row.try_get("run_id")?,
                artifact_type: row.try_get("artifact_type")?,
                artifact_uri: row.try_get("artifact_uri")?,
                metadata: row.try_get("metadata_json")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// True when the URI is linked to the run through an artifact or check row.
/// The artifact content endpoint serves nothing else.
pub async fn artifact_uri_linked(
    conn: &mut PgConnection,
    run_id: &str,
    uri: &str,
) -> CoreResult<bool> {
    let (linked,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from run_artifacts where run_id = $1 and artifact_uri = $2
            union all
            select 1 from validation_checks where run_id = $1 and artifact_uri = $2
        )
        "#,
    )
    .bind(run_id)
    .bind(uri)
    .fetch_one(&mut *conn)
    .await
    .context("artifact_uri_linked failed")?;
    Ok(linked)
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApprovalRow {
    pub id: i64,
    pub run_id: String,
    pub reviewer_id: Option<String>,
    pub decision: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewApproval {
    pub run_id: String,
    pub reviewer_id: Option<String>,
    pub decision: String,
    pub reason: Option<String>,
}

fn map_approval(row: &PgRow) -> CoreResult<ApprovalRow> {
    Ok(ApprovalRow {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        reviewer_id: row.try_get("reviewer_id")?,
        decision: row.try_get("decision")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert_approval(conn: &mut PgConnection, new: &NewApproval) -> CoreResult<ApprovalRow> {
    let row = sqlx::query(
        r#"
        insert into approvals (run_id, reviewer_id, decision, reason)
        values ($1, $2, $3, $4)
        returning id, run_id, reviewer_id, decision, reason, created_at
        "#,
    )
    .bind(&new.run_id)
    .bind(&new.reviewer_id)
    .bind(&new.decision)
    .bind(&new.reason)
    .fetch_one(&mut *conn)
    .await
    .context("insert_approval failed")?;
    map_approval(&row)
}

pub async fn list_approvals(
    conn: &mut PgConnection,
    run_id: &str,
) -> CoreResult<Vec<ApprovalRow>> {
    let rows = sqlx::query(
        r#"
        select id, run_id, reviewer_id, decision, reason, created_at
        from approvals
        where run_id = $1
        order by created_at asc, id asc
        "#,
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await
    .context("list_approvals failed")?;
    rows.iter().map(map_approval).collect()
}

// ---------------------------------------------------------------------------
// Releases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReleaseRow {
    pub id: i64,
    pub release_id: String,
    pub commit_sha: String,
    pub migration_marker: Option<String>,
    pub status: String,
    pub deployed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRelease {
    pub release_id: String,
    pub commit_sha: String,
    pub migration_marker: Option<String>,
    pub status: String,
    pub deployed_at: Option<DateTime<Utc>>,
}

fn map_release(row: &PgRow) -> CoreResult<ReleaseRow> {
    Ok(ReleaseRow {
        id: row.try_get("id")?,
        release_id: row.try_get("release_id")?,
        commit_sha: row.try_get("commit_sha")?,
        migration_marker: row.try_get("migration_marker")?,
        status: row.try_get("status")?,
        deployed_at: row.try_get("deployed_at")?,
    })
}

pub async fn insert_release(conn: &mut PgConnection, new: &NewRelease) -> CoreResult<ReleaseRow> {
    let row = sqlx::query(
        r#"
        insert into releases (release_id, commit_sha, migration_marker, status, deployed_at)
        values ($1, $2, $3, $4, $5)
        returning id, release_id, commit_sha, migration_marker, status, deployed_at
        "#,
    )
    .bind(&new.release_id)
    .bind(&new.commit_sha)
    .bind(&new.migration_marker)
    .bind(&new.status)
    .bind(new.deployed_at)
    .fetch_one(&mut *conn)
    .await
    .context("insert_release failed")?;
    map_release(&row)
}

pub async fn list_releases(
    conn: &mut PgConnection,
    status: Option<&str>,
    limit: i64,
) -> CoreResult<Vec<ReleaseRow>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(
                r#"
                select id, release_id, commit_sha, migration_marker, status, deployed_at
                from releases
                where status = $1
                order by id desc
                limit $2
                "#,
            )
            .bind(status)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await
        }
        None => {
            sqlx::query(
                r#"
                select id, release_id, commit_sha, migration_marker, status, deployed_at
                from releases
                order by id desc
                limit $1
                "#,
            )
            .bind(limit)
            .fetch_all(&mut *conn)
            .await
        }
    }
    .context("list_releases failed")?;
    rows.iter().map(map_release).collect()
}

pub async fn fetch_release(
    conn: &mut PgConnection,
    release_id: &str,
) -> CoreResult<Option<ReleaseRow>> {
    let row = sqlx::query(
        r#"
        select id, release_id, commit_sha, migration_marker, status, deployed_at
        from releases
        where release_id = $1
        "#,
    )
    .bind(release_id)
    .fetch_optional(&mut *conn)
    .await
    .context("fetch_release failed")?;
    row.as_ref().map(map_release).transpose()
}

// ---------------------------------------------------------------------------
// Preview DB resets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PreviewDbResetRow {
    pub id: i64,
    pub run_id: String,
    pub slot_id: String,
    pub db_name: String,
    pub strategy: String,
    pub seed_version: Option<String>,
    pub snapshot_version: Option<String>,
    pub reset_status: String,
    pub reset_started_at: DateTime<Utc>,
    pub reset_completed_at: Option<DateTime<Utc>>,
    pub details: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewPreviewDbReset {
    pub run_id: String,
    pub slot_id: String,
    pub db_name: String,
    pub strategy: String,
    pub seed_version: Option<String>,
    pub snapshot_version: Option<String>,
}

fn map_reset(row: &PgRow) -> CoreResult<PreviewDbResetRow> {
    Ok(PreviewDbResetRow {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        slot_id: row.try_get("slot_id")?,
        db_name: row.try_get("db_name")?,
        strategy: row.try_get("strategy")?,
        seed_version: row.try_get("seed_version")?,
        snapshot_version: row.try_get("snapshot_version")?,
        reset_status: row.try_get("reset_status")?,
        reset_started_at: row.try_get("reset_started_at")?,
        reset_completed_at: row.try_get("reset_completed_at")?,
        details: row.try_get("details_json")?,
    })
}

/// Record a reset attempt in `running`; the caller marks the outcome.
pub async fn insert_preview_db_reset(
    conn: &mut PgConnection,
    new: &NewPreviewDbReset,
) -> CoreResult<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into preview_db_resets
            (run_id, slot_id, db_name, strategy, seed_version, snapshot_version, reset_status)
        values ($1, $2, $3, $4, $5, $6, 'running')
        returning id
        "#,
    )
    .bind(&new.run_id)
    .bind(&new.slot_id)
    .bind(&new.db_name)
    .bind(&new.strategy)
    .bind(&new.seed_version)
    .bind(&new.snapshot_version)
    .fetch_one(&mut *conn)
    .await
    .context("insert_preview_db_reset failed")?;
    Ok(id)
}

pub async fn complete_preview_db_reset(
    conn: &mut PgConnection,
    id: i64,
    reset_status: &str,
    details: &Value,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        update preview_db_resets
           set reset_status = $2,
               reset_completed_at = now(),
               details_json = $3
         where id = $1
        "#,
    )
    .bind(id)
    .bind(reset_status)
    .bind(details)
    .execute(&mut *conn)
    .await
    .context("complete_preview_db_reset failed")?;
    Ok(())
}

pub async fn list_resets_since(
    conn: &mut PgConnection,
    since: DateTime<Utc>,
) -> CoreResult<Vec<PreviewDbResetRow>> {
    let rows = sqlx::query(
        r#"
        select id, run_id, slot_id, db_name, strategy, seed_version, snapshot_version,
               reset_status, reset_started_at, reset_completed_at, details_json
        from preview_db_resets
        where reset_started_at >= $1
        order by reset_started_at desc, id desc
        "#,
    )
    .bind(since)
    .fetch_all(&mut *conn)
    .await
    .context("list_resets_since failed")?;
    rows.iter().map(map_reset).collect()
}
