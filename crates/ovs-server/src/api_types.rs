//! Request and response bodies for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ovs_db::records::{ApprovalRow, ReleaseRow, RunArtifactRow, ValidationCheckRow};
use ovs_db::RunRow;

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub page_title: Option<String>,
    #[serde(default)]
    pub element_hint: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRunRequest {
    pub to_status: String,
    #[serde(default)]
    pub failure_reason_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
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

impl From<RunRow> for RunResponse {
    fn from(run: RunRow) -> Self {
        RunResponse {
            id: run.id,
            title: run.title,
            prompt: run.prompt,
            status: run.status,
            route: run.route,
            slot_id: run.slot_id,
            branch_name: run.branch_name,
            worktree_path: run.worktree_path,
            commit_sha: run.commit_sha,
            parent_run_id: run.parent_run_id,
            created_by: run.created_by,
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    #[serde(default)]
    pub since_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub order: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamEventsQuery {
    #[serde(default)]
    pub since_id: Option<i64>,
    #[serde(default)]
    pub follow: Option<bool>,
    #[serde(default)]
    pub poll_interval_seconds: Option<f64>,
    #[serde(default)]
    pub heartbeat_seconds: Option<u64>,
    #[serde(default)]
    pub batch_limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RunEventResponse {
    pub schema_version: i64,
    pub id: i64,
    pub run_id: String,
    pub event_type: String,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<ovs_db::RunEventRow> for RunEventResponse {
    fn from(event: ovs_db::RunEventRow) -> Self {
        RunEventResponse {
            schema_version: ovs_audit::event_schema_version(event.payload.as_ref()),
            id: event.id,
            run_id: event.run_id,
            event_type: event.event_type,
            status_from: event.status_from,
            status_to: event.status_to,
            payload: event.payload,
            created_at: event.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AcquireSlotRequest {
    pub run_id: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ReleaseSlotRequest {
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatSlotRequest {
    pub run_id: String,
}

// ---------------------------------------------------------------------------
// Worktrees
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AssignWorktreeRequest {
    pub run_id: String,
    pub slot_id: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct CleanupWorktreeRequest {
    #[serde(default)]
    pub run_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct ApproveRequest {
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reviewer_id: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub failure_reason_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApprovalResponse {
    pub id: i64,
    pub run_id: String,
    pub reviewer_id: Option<String>,
    pub decision: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<ApprovalRow> for ApprovalResponse {
    fn from(row: ApprovalRow) -> Self {
        ApprovalResponse {
            id: row.id,
            run_id: row.run_id,
            reviewer_id: row.reviewer_id,
            decision: row.decision,
            reason: row.reason,
            created_at: row.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Checks / artifacts / releases
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ArtifactContentQuery {
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct ValidationCheckResponse {
    pub id: i64,
    pub run_id: String,
    pub check_name: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub artifact_uri: Option<String>,
}

impl From<ValidationCheckRow> for ValidationCheckResponse {
    fn from(row: ValidationCheckRow) -> Self {
        ValidationCheckResponse {
            id: row.id,
            run_id: row.run_id,
            check_name: row.check_name,
            status: row.status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            artifact_uri: row.artifact_uri,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunArtifactResponse {
    pub id: i64,
    pub run_id: String,
    pub artifact_type: String,
    pub artifact_uri: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<RunArtifactRow> for RunArtifactResponse {
    fn from(row: RunArtifactRow) -> Self {
        RunArtifactResponse {
            id: row.id,
            run_id: row.run_id,
            artifact_type: row.artifact_type,
            artifact_uri: row.artifact_uri,
            metadata: row.metadata,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListReleasesQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub id: i64,
    pub release_id: String,
    pub commit_sha: String,
    pub migration_marker: Option<String>,
    pub status: String,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl From<ReleaseRow> for ReleaseResponse {
    fn from(row: ReleaseRow) -> Self {
        ReleaseResponse {
            id: row.id,
            release_id: row.release_id,
            commit_sha: row.commit_sha,
            migration_marker: row.migration_marker,
            status: row.status,
            deployed_at: row.deployed_at,
        }
    }
}
