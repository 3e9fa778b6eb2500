//! Approval / merge-gate pipeline.
//!
//! Approving a run re-runs the required checks pinned to the exact commit the
//! worker produced, fast-forward-merges the run branch into trunk with a
//! merge commit, optionally pushes under a non-FF guard, reloads the deployed
//! backend, and releases the slot. Every step runs under the caller's
//! transaction, which holds a row lock on the run for the duration.

mod checks;
mod git_ops;

use serde_json::json;
use sqlx::PgConnection;
use tracing::info;

use ovs_config::{PushMode, Settings};
use ovs_db::events::{append_run_event, NewRunEvent};
use ovs_db::records::{self, ApprovalRow, NewApproval, NewRelease};
use ovs_db::runs::{self, RunRow};
use ovs_domain::{
    ensure_transition_allowed, CoreError, CoreResult, FailureReasonCode, RunState,
};
use ovs_slots::SlotLeaseManager;
use ovs_worktree::WorktreeManager;

pub use checks::{run_merge_gate_checks, MergeGateResult};

/// The approval pipeline and its collaborators.
pub struct MergeGate {
    settings: Settings,
    leases: SlotLeaseManager,
    worktrees: WorktreeManager,
}

impl MergeGate {
    pub fn new(settings: &Settings) -> Self {
        MergeGate {
            settings: settings.clone(),
            leases: SlotLeaseManager::new(settings),
            worktrees: WorktreeManager::new(settings),
        }
    }

    /// Approve a run: auto-advance from `preview_ready`, re-run the gate
    /// checks commit-pinned, merge, push (per mode), deploy, release the
    /// slot. Returns the recorded approval; a failed gate still returns it,
    /// with the run transitioned to `failed`.
    pub async fn approve(
        &self,
        conn: &mut PgConnection,
        run_id: &str,
        reviewer_id: Option<&str>,
        reason: Option<&str>,
    ) -> CoreResult<ApprovalRow> {
        let run = runs::fetch_run_for_update(conn, run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run_not_found"))?;
        let mut state = run.state()?;

        // Direct approve on a preview-ready run advances it first.
        if state == RunState::PreviewReady {
            state = self
                .transition(
                    conn,
                    &run.id,
                    state,
                    RunState::NeedsApproval,
                    None,
                    json!({"source": "approve_endpoint", "phase": "auto_needs_approval"}),
                )
                .await?;
        }

        state = self
            .transition(
                conn,
                &run.id,
                state,
                RunState::Approved,
                None,
                json!({"source": "approve_endpoint", "phase": "approved"}),
            )
            .await?;

        let approval = records::insert_approval(
            conn,
            &NewApproval {
                run_id: run.id.clone(),
                reviewer_id: reviewer_id.map(str::to_string),
                decision: "approved".to_string(),
                reason: reason.map(str::to_string),
            },
        )
        .await?;
        append_run_event(
            conn,
            NewRunEvent::new(&run.id, "approval_decision")
                .with_payload(json!({"decision": "approved", "reason": reason}))
                .with_actor(reviewer_id)
                .with_audit("run.approval.decision"),
        )
        .await?;

        // Re-read: the worker wrote commit_sha/worktree_path after claim.
        let run = runs::fetch_run(conn, run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run_not_found"))?;

        let gate = run_merge_gate_checks(conn, &self.settings, &run).await?;
        if !gate.passed {
            let failure_reason = gate.failure_reason.unwrap_or(FailureReasonCode::ChecksFailed);
            self.transition(
                conn,
                &run.id,
                state,
                RunState::Failed,
                Some(failure_reason),
                json!({
                    "source": "merge_gate",
                    "failure_reason_code": failure_reason.as_str(),
                    "failed_check": gate.failed_check,
                    "detail": gate.detail,
                }),
            )
            .await?;
            return Ok(approval);
        }

        state = self
            .transition(
                conn,
                &run.id,
                state,
                RunState::Merging,
                None,
                json!({"source": "merge_gate", "phase": "merge_start"}),
            )
            .await?;

        let merge = git_ops::merge_run_commit_to_trunk(&self.settings, &run).await?;
        let merged_sha = match merge {
            git_ops::MergeOutcome::Merged { merged_sha } => merged_sha,
            git_ops::MergeOutcome::Failed { detail } => {
                self.transition(
                    conn,
                    &run.id,
                    state,
                    RunState::Failed,
                    Some(FailureReasonCode::MergeConflict),
                    json!({
                        "source": "merge_gate",
                        "failure_reason_code": FailureReasonCode::MergeConflict.as_str(),
                        "detail": detail,
                    }),
                )
                .await?;
                return Ok(approval);
            }
        };

        runs::set_run_commit_sha(conn, &run.id, &merged_sha).await?;
        let release_id = git_ops::release_id_for_run(&run.id);
        records::insert_release(
            conn,
            &NewRelease {
                release_id: release_id.clone(),
                commit_sha: merged_sha.clone(),
                migration_marker: None,
                status: "deployed".to_string(),
                deployed_at: Some(chrono::Utc::now()),
            },
        )
        .await?;
        info!(run_id = %run.id, release_id = %release_id, merged_sha = %merged_sha, "run merged to trunk");

        if self.settings.merge_gate.push_mode != PushMode::Manual {
            let push = match git_ops::push_trunk_guarded(&self.settings).await {
                Ok(push) => push,
                // A non-FF remote is a push failure for this run, not a
                // pipeline crash.
                Err(CoreError::PushNotFastForward(detail)) => {
                    git_ops::PushOutcome::not_fast_forward(detail)
                }
                Err(other) => return Err(other),
            };
            append_run_event(
                conn,
                NewRunEvent::new(&run.id, "merge_gate_push_finished").with_payload(json!({
                    "mode": self.settings.merge_gate.push_mode.as_str(),
                    "remote": self.settings.merge_gate.push_remote,
                    "branch": self.settings.merge_gate.push_branch,
                    "pushed": push.pushed,
                    "detail": push.detail,
                })),
            )
            .await?;
            if !push.pushed {
                self.transition(
                    conn,
                    &run.id,
                    state,
                    RunState::Failed,
                    Some(FailureReasonCode::DeployPushFailed),
                    json!({
                        "source": "merge_gate",
                        "failure_reason_code": FailureReasonCode::DeployPushFailed.as_str(),
                        "detail": push.detail,
                        "rollback_guidance": push.rollback_guidance,
                    }),
                )
                .await?;
                return Ok(approval);
            }
        }

        state = self
            .transition(
                conn,
                &run.id,
                state,
                RunState::Deploying,
                None,
                json!({"source": "merge_gate", "phase": "deploy_start"}),
            )
            .await?;

        if let Err(detail) = self.deploy_backend(conn, &run).await? {
            self.transition(
                conn,
                &run.id,
                state,
                RunState::Failed,
                Some(FailureReasonCode::DeployHealthcheckFailed),
                json!({
                    "source": "merge_gate",
                    "failure_reason_code": FailureReasonCode::DeployHealthcheckFailed.as_str(),
                    "detail": detail,
                }),
            )
            .await?;
            return Ok(approval);
        }

        self.transition(
            conn,
            &run.id,
            state,
            RunState::Merged,
            None,
            json!({
                "source": "merge_gate",
                "phase": "merge_complete",
                "merged_commit_sha": merged_sha,
            }),
        )
        .await?;

        if let Some(slot_id) = &run.slot_id {
            let released = self.leases.release(conn, slot_id, Some(&run.id)).await?;
            if !released.released {
                append_run_event(
                    conn,
                    NewRunEvent::new(&run.id, "slot_release_skipped").with_payload(json!({
                        "source": "merge_gate",
                        "slot_id": slot_id,
                        "reason": released.reason,
                    })),
                )
                .await?;
            }
        }

        Ok(approval)
    }

    /// Reject a run. Terminal runs keep their state; the approval row is
    /// still recorded. Non-terminal runs fail with the supplied reason code
    /// and their slot, worktree, and branch are torn down, each outcome
    /// recorded in the decision event.
    pub async fn reject(
        &self,
        conn: &mut PgConnection,
        run_id: &str,
        reviewer_id: Option<&str>,
        reason: &str,
        failure_reason: FailureReasonCode,
    ) -> CoreResult<ApprovalRow> {
        let run = runs::fetch_run_for_update(conn, run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run_not_found"))?;
        let state = run.state()?;

        let approval = records::insert_approval(
            conn,
            &NewApproval {
                run_id: run.id.clone(),
                reviewer_id: reviewer_id.map(str::to_string),
                decision: "rejected".to_string(),
                reason: Some(format!(
                    "{reason} [failure_reason_code={}]",
                    failure_reason.as_str()
                )),
            },
        )
        .await?;

        if state.is_terminal() {
            append_run_event(
                conn,
                NewRunEvent::new(&run.id, "approval_decision")
                    .with_payload(json!({
                        "decision": "rejected",
                        "reason": reason,
                        "failure_reason_code": failure_reason.as_str(),
                        "run_already_terminal": true,
                    }))
                    .with_actor(reviewer_id)
                    .with_audit("run.approval.decision"),
            )
            .await?;
            return Ok(approval);
        }

        self.transition(
            conn,
            &run.id,
            state,
            RunState::Failed,
            Some(failure_reason),
            json!({
                "source": "reject_endpoint",
                "failure_reason_code": failure_reason.as_str(),
                "reason": reason,
            }),
        )
        .await?;

        // Resource teardown: worktree, lease, branch. Outcomes are recorded,
        // never fatal to the rejection itself.
        let cleanup = match &run.slot_id {
            Some(slot_id) => Some(self.worktrees.cleanup(conn, slot_id, Some(&run.id)).await?),
            None => None,
        };
        let release = match &run.slot_id {
            Some(slot_id) => Some(self.leases.release(conn, slot_id, Some(&run.id)).await?),
            None => None,
        };
        let branch_delete = self.worktrees.delete_run_branch(&run.id).await?;

        append_run_event(
            conn,
            NewRunEvent::new(&run.id, "approval_decision")
                .with_payload(json!({
                    "decision": "rejected",
                    "reason": reason,
                    "failure_reason_code": failure_reason.as_str(),
                    "cleanup_worktree": cleanup,
                    "release_slot": release,
                    "delete_run_branch": branch_delete,
                }))
                .with_actor(reviewer_id)
                .with_audit("run.approval.decision"),
        )
        .await?;

        Ok(approval)
    }

    /// Run the configured backend reload + healthcheck commands, persisting
    /// a deploy log artifact for each. `Ok(Err(detail))` is a deploy failure.
    async fn deploy_backend(
        &self,
        conn: &mut PgConnection,
        run: &RunRow,
    ) -> CoreResult<Result<(), String>> {
        let store = ovs_artifacts::ArtifactStore::new(&self.settings.worker.artifact_root);
        let steps = [
            ("deploy-reload", &self.settings.merge_gate.deploy_backend_reload_command),
            ("deploy-health", &self.settings.merge_gate.deploy_backend_healthcheck_command),
        ];

        for (step, command) in steps {
            let Some(command) = command else { continue };
            let log_path = store
                .merge_gate_log_path(&run.id, step)
                .map_err(CoreError::Internal)?;
            let outcome = checks::run_gate_command(
                &self.settings,
                command,
                &self.settings.repo_root_path,
                self.settings.merge_gate.check_default_timeout,
                &log_path,
            )
            .await?;

            records::insert_artifact(
                conn,
                &records::NewArtifact {
                    run_id: run.id.clone(),
                    artifact_type: "merge_gate_deploy_log".to_string(),
                    artifact_uri: log_path.to_string_lossy().into_owned(),
                    metadata: Some(json!({
                        "step": step,
                        "command": command,
                        "exit_code": outcome.exit_code,
                        "timed_out": outcome.timed_out,
                    })),
                },
            )
            .await?;

            if !outcome.clean() {
                let detail = if outcome.timed_out {
                    format!("{step}_timed_out")
                } else {
                    format!("{step}_failed:exit_{}", outcome.exit_code.unwrap_or(-1))
                };
                return Ok(Err(detail));
            }
        }
        Ok(Ok(()))
    }

    /// Validate, apply, and record one state transition. Returns the new
    /// state so callers can thread it forward.
    async fn transition(
        &self,
        conn: &mut PgConnection,
        run_id: &str,
        current: RunState,
        target: RunState,
        failure_reason: Option<FailureReasonCode>,
        payload: serde_json::Value,
    ) -> CoreResult<RunState> {
        ensure_transition_allowed(current, target, failure_reason)?;
        runs::update_run_status(conn, run_id, target).await?;
        append_run_event(
            conn,
            NewRunEvent::new(run_id, "status_transition")
                .with_transition(current.as_str(), target.as_str())
                .with_payload(payload)
                .with_audit("run.status.transition"),
        )
        .await?;
        Ok(target)
    }
}
