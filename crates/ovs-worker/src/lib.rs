//! Worker orchestrator: claim a queued run, drive the agent inside its
//! worktree, validate, publish the preview, and mark the run ready.
//!
//! One cycle is one run. Each phase opens its own transaction; the claim
//! transaction is the critical one, folding the queue lock, the lease
//! acquire, the `queued -> planning` transition, and the worktree assignment
//! into a single commit.

mod publish;
mod reset;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use ovs_artifacts::ArtifactStore;
use ovs_config::Settings;
use ovs_db::events::{append_run_event, NewRunEvent};
use ovs_db::records::{insert_artifact, insert_check, NewArtifact, NewCheck};
use ovs_db::runs;
use ovs_domain::{
    ensure_transition_allowed, recoverable_payload_fields, CoreResult, FailureReasonCode,
    RunState,
};
use ovs_exec::{
    run_captured, run_supervised, CommandSpec, ExecOutcome, ExecPolicy, HeartbeatVerdict,
    SupervisionIntervals, SupervisionProbe,
};
use ovs_slots::SlotLeaseManager;
use ovs_worktree::WorktreeManager;

/// Carried forward from the claim transaction into the rest of the cycle.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run_id: String,
    pub prompt: String,
    pub slot_id: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub trace_id: String,
}

pub struct WorkerOrchestrator {
    pool: PgPool,
    settings: Settings,
    store: ArtifactStore,
    leases: SlotLeaseManager,
    worktrees: WorktreeManager,
    policy: ExecPolicy,
    http: reqwest::Client,
}

impl WorkerOrchestrator {
    pub fn new(pool: PgPool, settings: Settings) -> Self {
        WorkerOrchestrator {
            store: ArtifactStore::new(&settings.worker.artifact_root),
            leases: SlotLeaseManager::new(&settings),
            worktrees: WorktreeManager::new(&settings),
            policy: ExecPolicy::from_settings(&settings),
            http: reqwest::Client::new(),
            pool,
            settings,
        }
    }

    /// Process at most one queued run. Returns whether a run was claimed.
    pub async fn process_next_run(&self) -> Result<bool> {
        let Some(claimed) = self.claim_next_run().await? else {
            return Ok(false);
        };
        info!(
            run_id = %claimed.run_id,
            slot_id = %claimed.slot_id,
            trace_id = %claimed.trace_id,
            "run claimed"
        );
        self.execute_claimed_run(&claimed).await?;
        Ok(true)
    }

    /// One transaction: lock the oldest queued run (skipping contended rows),
    /// acquire a lease, move to `planning`, ensure a trace id, and bind the
    /// worktree. The lease rows are written before `assign` runs, so the
    /// binding's lease-validity check sees them inside the same transaction.
    pub async fn claim_next_run(&self) -> Result<Option<ClaimedRun>> {
        let mut tx = self.pool.begin().await?;

        let Some(run) = runs::claim_next_queued_run(&mut tx).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let acquire = self.leases.acquire(&mut tx, &run.id).await?;
        if !acquire.acquired {
            // Keep the wait event; the run stays queued.
            tx.commit().await?;
            return Ok(None);
        }
        let slot_id = acquire.slot_id.unwrap_or_default();
        if slot_id.is_empty() {
            tx.commit().await?;
            return Ok(None);
        }

        let state = run.state()?;
        if ensure_transition_allowed(state, RunState::Planning, None).is_err() {
            warn!(run_id = %run.id, status = %run.status, "unable to claim run, invalid transition");
            tx.rollback().await?;
            return Ok(None);
        }
        runs::update_run_status(&mut tx, &run.id, RunState::Planning).await?;
        append_run_event(
            &mut tx,
            NewRunEvent::new(&run.id, "status_transition")
                .with_transition(state.as_str(), RunState::Planning.as_str())
                .with_payload(json!({"source": "worker", "phase": "claim"}))
                .with_audit("run.status.transition"),
        )
        .await?;

        let trace_id = match runs::run_trace_id(&mut tx, &run.id).await? {
            Some(trace_id) => trace_id,
            None => {
                let trace_id = Uuid::new_v4().simple().to_string();
                runs::merge_run_context_metadata(
                    &mut tx,
                    &run.id,
                    &json!({"trace_id": trace_id}),
                )
                .await?;
                trace_id
            }
        };

        let assigned = self.worktrees.assign(&mut tx, &run.id, &slot_id).await?;
        tx.commit().await?;

        Ok(Some(ClaimedRun {
            run_id: run.id,
            prompt: run.prompt,
            slot_id,
            branch_name: assigned.branch_name,
            worktree_path: PathBuf::from(assigned.worktree_path),
            trace_id,
        }))
    }

    async fn execute_claimed_run(&self, claimed: &ClaimedRun) -> Result<()> {
        if !reset::run_preview_db_reset(self, claimed).await? {
            return Ok(());
        }

        if !self.mark_editing(claimed).await? {
            return Ok(());
        }

        let command = self
            .settings
            .codex_command(&claimed.prompt, &claimed.worktree_path.to_string_lossy());
        let output_path = self.store.codex_stdout_path(&claimed.run_id)?;
        info!(run_id = %claimed.run_id, trace_id = %claimed.trace_id, "executing agent");

        let started_at = Utc::now();
        let spec = CommandSpec {
            command: command.clone(),
            cwd: claimed.worktree_path.clone(),
            timeout: self.settings.worker.run_timeout,
            output_path,
            injected_env: self.injected_env(claimed, None, None),
        };
        let mut probe = WorkerProbe {
            pool: self.pool.clone(),
            leases: self.leases.clone(),
            run_id: claimed.run_id.clone(),
            slot_id: claimed.slot_id.clone(),
        };
        let result = run_supervised(
            &spec,
            &self.policy,
            &mut probe,
            SupervisionIntervals::from_settings(&self.settings),
        )
        .await?;
        let ended_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        let Some(run) = runs::fetch_run_for_update(&mut tx, &claimed.run_id).await? else {
            tx.rollback().await?;
            return Ok(());
        };

        self.record_agent_artifacts(&mut tx, claimed, &command, &result, started_at, ended_at)
            .await?;

        if run.status == RunState::Canceled.as_str() || result.canceled {
            self.finalize_canceled(&mut tx, claimed, &result).await?;
            tx.commit().await?;
            return Ok(());
        }
        if result.lease_expired {
            self.finalize_expired(&mut tx, claimed, &run.status).await?;
            tx.commit().await?;
            return Ok(());
        }
        if result.timed_out {
            self.finalize_failed(
                &mut tx,
                claimed,
                &run.status,
                FailureReasonCode::AgentTimeout,
                json!({"exit_code": result.exit_code, "timed_out": true}),
            )
            .await?;
            tx.commit().await?;
            return Ok(());
        }
        if result.exit_code != Some(0) {
            self.finalize_failed(
                &mut tx,
                claimed,
                &run.status,
                FailureReasonCode::UnknownError,
                json!({"exit_code": result.exit_code, "timed_out": false}),
            )
            .await?;
            tx.commit().await?;
            return Ok(());
        }
        tx.commit().await?;

        // Commit whatever the agent produced before validation runs.
        let commit_sha = match self.auto_commit(claimed).await? {
            Ok(commit_sha) => commit_sha,
            Err(detail) => {
                let mut tx = self.pool.begin().await?;
                let status = self.current_status(&mut tx, &claimed.run_id).await?;
                self.finalize_failed(
                    &mut tx,
                    claimed,
                    &status,
                    FailureReasonCode::UnknownError,
                    json!({"detail": detail}),
                )
                .await?;
                tx.commit().await?;
                return Ok(());
            }
        };

        if !self.run_validation_checks(claimed, &commit_sha).await? {
            return Ok(());
        }

        if !publish::publish_preview(self, claimed, &commit_sha).await? {
            return Ok(());
        }

        if !publish::slot_integration_probe(self, claimed).await? {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let status = self.current_status(&mut tx, &claimed.run_id).await?;
        self.transition(
            &mut tx,
            &claimed.run_id,
            &status,
            RunState::PreviewReady,
            None,
            json!({"source": "worker", "result": "ready_for_preview", "commit_sha": commit_sha}),
        )
        .await?;
        tx.commit().await?;
        info!(run_id = %claimed.run_id, slot_id = %claimed.slot_id, "preview ready");
        Ok(())
    }

    /// `planning -> editing` plus the agent-start event; bails out when the
    /// run was canceled between claim and execution.
    async fn mark_editing(&self, claimed: &ClaimedRun) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(run) = runs::fetch_run_for_update(&mut tx, &claimed.run_id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };

        if run.status == RunState::Canceled.as_str() {
            append_run_event(
                &mut tx,
                NewRunEvent::new(&run.id, "worker_skipped_canceled_before_execution")
                    .with_payload(json!({"source": "worker", "slot_id": claimed.slot_id})),
            )
            .await?;
            self.leases
                .release(&mut tx, &claimed.slot_id, Some(&run.id))
                .await?;
            tx.commit().await?;
            return Ok(false);
        }

        self.transition(
            &mut tx,
            &run.id,
            &run.status,
            RunState::Editing,
            None,
            json!({"source": "worker", "slot_id": claimed.slot_id}),
        )
        .await?;
        append_run_event(
            &mut tx,
            NewRunEvent::new(&run.id, "codex_command_started")
                .with_payload(json!({"source": "worker", "slot_id": claimed.slot_id})),
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_agent_artifacts(
        &self,
        conn: &mut PgConnection,
        claimed: &ClaimedRun,
        command: &[String],
        result: &ExecOutcome,
        started_at: chrono::DateTime<Utc>,
        ended_at: chrono::DateTime<Utc>,
    ) -> CoreResult<()> {
        let artifact_uri = result.output_path.to_string_lossy().into_owned();
        insert_artifact(
            conn,
            &NewArtifact {
                run_id: claimed.run_id.clone(),
                artifact_type: "codex_stdout".to_string(),
                artifact_uri: artifact_uri.clone(),
                metadata: Some(json!({
                    "exit_code": result.exit_code,
                    "timed_out": result.timed_out,
                    "canceled": result.canceled,
                    "lease_expired": result.lease_expired,
                })),
            },
        )
        .await?;
        append_run_event(
            conn,
            NewRunEvent::new(&claimed.run_id, "codex_command_finished").with_payload(json!({
                "source": "worker",
                "command": command,
                "artifact_uri": artifact_uri,
                "exit_code": result.exit_code,
                "timed_out": result.timed_out,
                "canceled": result.canceled,
                "lease_expired": result.lease_expired,
                "duration_seconds": result.duration.as_secs_f64(),
                "output_excerpt": result.output_excerpt,
                "trace_id": claimed.trace_id,
            })),
        )
        .await?;
        insert_check(
            conn,
            &NewCheck {
                run_id: claimed.run_id.clone(),
                check_name: "codex_cli_execution".to_string(),
                status: if result.clean() { "passed" } else { "failed" }.to_string(),
                started_at,
                ended_at,
                artifact_uri: Some(result.output_path.to_string_lossy().into_owned()),
            },
        )
        .await?;
        Ok(())
    }

    /// Commit the agent's changes on the run branch.
    ///
    /// Detected changes without a successful commit is a hard failure; a
    /// clean tree pins the current HEAD instead.
    async fn auto_commit(&self, claimed: &ClaimedRun) -> Result<Result<String, String>> {
        let wt = claimed.worktree_path.to_string_lossy().into_owned();

        let head_branch = run_captured("git", &["-C", &wt, "rev-parse", "--abbrev-ref", "HEAD"], None).await?;
        if head_branch.stdout.trim() != claimed.branch_name {
            let switched =
                run_captured("git", &["-C", &wt, "switch", &claimed.branch_name], None).await?;
            if !switched.success() {
                return Ok(Err(format!(
                    "branch_switch_failed:{}",
                    switched.message()
                )));
            }
        }

        let status = run_captured("git", &["-C", &wt, "status", "--porcelain"], None).await?;
        if !status.success() {
            return Ok(Err(format!("git_status_failed:{}", status.message())));
        }
        let has_changes = !status.stdout.trim().is_empty();

        if has_changes {
            let added = run_captured("git", &["-C", &wt, "add", "-A"], None).await?;
            if !added.success() {
                return Ok(Err("commit_required_for_detected_changes".to_string()));
            }

            let message = format!("codex: run {}", claimed.run_id);
            let mut args: Vec<String> = vec!["-C".into(), wt.clone()];
            if let Some(name) = &self.settings.worker.git_author_name {
                args.push("-c".into());
                args.push(format!("user.name={name}"));
            }
            if let Some(email) = &self.settings.worker.git_author_email {
                args.push("-c".into());
                args.push(format!("user.email={email}"));
            }
            args.extend(["commit".into(), "-m".into(), message]);
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            let committed = run_captured("git", &arg_refs, None).await?;
            if !committed.success() {
                return Ok(Err("commit_required_for_detected_changes".to_string()));
            }
        }

        let head = run_captured("git", &["-C", &wt, "rev-parse", "HEAD"], None).await?;
        let commit_sha = head.stdout.trim().to_string();
        if !head.success() || commit_sha.is_empty() {
            return Ok(Err("head_unreadable_after_commit".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        runs::set_run_commit_sha(&mut tx, &claimed.run_id, &commit_sha).await?;
        append_run_event(
            &mut tx,
            NewRunEvent::new(&claimed.run_id, "changes_committed").with_payload(json!({
                "source": "worker",
                "commit_sha": commit_sha,
                "had_changes": has_changes,
                "branch_name": claimed.branch_name,
            })),
        )
        .await?;
        tx.commit().await?;

        Ok(Ok(commit_sha))
    }

    /// `editing -> testing`, then each configured required check in order.
    /// Returns false when the cycle ended (run finalized).
    async fn run_validation_checks(&self, claimed: &ClaimedRun, commit_sha: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let status = self.current_status(&mut tx, &claimed.run_id).await?;
        self.transition(
            &mut tx,
            &claimed.run_id,
            &status,
            RunState::Testing,
            None,
            json!({"source": "worker", "check": "codex_cli_execution"}),
        )
        .await?;
        tx.commit().await?;

        for check_name in self.settings.worker.required_checks.clone() {
            let Some(command) = self.settings.worker_check_command(&check_name) else {
                let mut tx = self.pool.begin().await?;
                let status = self.current_status(&mut tx, &claimed.run_id).await?;
                self.finalize_failed(
                    &mut tx,
                    claimed,
                    &status,
                    FailureReasonCode::ValidationFailed,
                    json!({
                        "check_name": check_name,
                        "detail": "missing_check_command_configuration",
                    }),
                )
                .await?;
                tx.commit().await?;
                return Ok(false);
            };

            let log_path = self.store.check_log_path(&claimed.run_id, &check_name)?;
            let started_at = Utc::now();
            let spec = CommandSpec {
                command,
                cwd: claimed.worktree_path.clone(),
                timeout: self.settings.worker_check_timeout(&check_name),
                output_path: log_path.clone(),
                injected_env: self.injected_env(claimed, Some(commit_sha), Some(&check_name)),
            };
            let mut probe = WorkerProbe {
                pool: self.pool.clone(),
                leases: self.leases.clone(),
                run_id: claimed.run_id.clone(),
                slot_id: claimed.slot_id.clone(),
            };
            let outcome = run_supervised(
                &spec,
                &self.policy,
                &mut probe,
                SupervisionIntervals::from_settings(&self.settings),
            )
            .await?;
            let ended_at = Utc::now();

            let status_label = if outcome.canceled {
                "canceled"
            } else if outcome.lease_expired {
                "expired"
            } else if outcome.timed_out {
                "timed_out"
            } else if outcome.exit_code == Some(0) {
                "passed"
            } else {
                "failed"
            };

            let artifact_uri = log_path.to_string_lossy().into_owned();
            let mut tx = self.pool.begin().await?;
            insert_check(
                &mut tx,
                &NewCheck {
                    run_id: claimed.run_id.clone(),
                    check_name: check_name.clone(),
                    status: status_label.to_string(),
                    started_at,
                    ended_at,
                    artifact_uri: Some(artifact_uri.clone()),
                },
            )
            .await?;
            append_run_event(
                &mut tx,
                NewRunEvent::new(&claimed.run_id, "validation_check_finished").with_payload(
                    json!({
                        "source": "worker",
                        "check_name": check_name,
                        "status": status_label,
                        "exit_code": outcome.exit_code,
                        "timed_out": outcome.timed_out,
                        "artifact_uri": artifact_uri,
                        "commit_sha": commit_sha,
                    }),
                ),
            )
            .await?;

            if outcome.canceled {
                self.finalize_canceled(&mut tx, claimed, &outcome).await?;
                tx.commit().await?;
                return Ok(false);
            }
            if outcome.lease_expired {
                let status = self.current_status(&mut tx, &claimed.run_id).await?;
                self.finalize_expired(&mut tx, claimed, &status).await?;
                tx.commit().await?;
                return Ok(false);
            }
            if outcome.timed_out {
                let status = self.current_status(&mut tx, &claimed.run_id).await?;
                self.finalize_failed(
                    &mut tx,
                    claimed,
                    &status,
                    FailureReasonCode::AgentTimeout,
                    json!({"check_name": check_name, "timed_out": true}),
                )
                .await?;
                tx.commit().await?;
                return Ok(false);
            }
            if outcome.exit_code != Some(0) {
                let status = self.current_status(&mut tx, &claimed.run_id).await?;
                self.finalize_failed(
                    &mut tx,
                    claimed,
                    &status,
                    FailureReasonCode::ValidationFailed,
                    json!({
                        "check_name": check_name,
                        "exit_code": outcome.exit_code,
                        "artifact_uri": artifact_uri,
                    }),
                )
                .await?;
                tx.commit().await?;
                return Ok(false);
            }
            tx.commit().await?;
        }

        Ok(true)
    }

    fn injected_env(
        &self,
        claimed: &ClaimedRun,
        commit_sha: Option<&str>,
        check_name: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut env = vec![
            ("RUN_ID".to_string(), claimed.run_id.clone()),
            ("SLOT_ID".to_string(), claimed.slot_id.clone()),
            ("TRACE_ID".to_string(), claimed.trace_id.clone()),
        ];
        if let Some(commit_sha) = commit_sha {
            env.push(("COMMIT_SHA".to_string(), commit_sha.to_string()));
        }
        if let Some(check_name) = check_name {
            env.push(("CHECK_NAME".to_string(), check_name.to_string()));
        }
        env
    }

    async fn current_status(
        &self,
        conn: &mut PgConnection,
        run_id: &str,
    ) -> Result<String> {
        let run = runs::fetch_run_for_update(conn, run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run disappeared: {run_id}"))?;
        Ok(run.status)
    }

    /// Idempotent transition: a no-op when the run already sits at `target`.
    async fn transition(
        &self,
        conn: &mut PgConnection,
        run_id: &str,
        current_status: &str,
        target: RunState,
        failure_reason: Option<FailureReasonCode>,
        payload: serde_json::Value,
    ) -> Result<()> {
        let current = RunState::parse(current_status)?;
        if current == target {
            return Ok(());
        }
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
        Ok(())
    }

    async fn finalize_canceled(
        &self,
        conn: &mut PgConnection,
        claimed: &ClaimedRun,
        result: &ExecOutcome,
    ) -> Result<()> {
        let cleanup = self
            .worktrees
            .cleanup(conn, &claimed.slot_id, Some(&claimed.run_id))
            .await?;
        let branch_delete = self.worktrees.delete_run_branch(&claimed.run_id).await?;
        append_run_event(
            conn,
            NewRunEvent::new(&claimed.run_id, "worker_observed_canceled").with_payload(json!({
                "source": "worker",
                "exit_code": result.exit_code,
                "canceled": true,
                "cleanup_worktree": cleanup,
                "delete_run_branch": branch_delete,
            })),
        )
        .await?;
        self.leases
            .release(conn, &claimed.slot_id, Some(&claimed.run_id))
            .await?;
        Ok(())
    }

    /// Lease TTL fired mid-execution. The heartbeat path usually already
    /// moved the run to `expired`; this makes the terminal state certain and
    /// frees the slot.
    async fn finalize_expired(
        &self,
        conn: &mut PgConnection,
        claimed: &ClaimedRun,
        current_status: &str,
    ) -> Result<()> {
        let mut payload = serde_json::Map::new();
        payload.insert("source".into(), json!("worker"));
        payload.insert("reason".into(), json!(FailureReasonCode::PreviewExpired.as_str()));
        payload.insert("lease_expired".into(), json!(true));
        for (key, value) in
            recoverable_payload_fields(&claimed.run_id, FailureReasonCode::PreviewExpired)
        {
            payload.insert(key.to_string(), value);
        }
        self.transition(
            conn,
            &claimed.run_id,
            current_status,
            RunState::Expired,
            None,
            serde_json::Value::Object(payload),
        )
        .await?;
        self.leases
            .release(conn, &claimed.slot_id, Some(&claimed.run_id))
            .await?;
        Ok(())
    }

    async fn finalize_failed(
        &self,
        conn: &mut PgConnection,
        claimed: &ClaimedRun,
        current_status: &str,
        failure_reason: FailureReasonCode,
        extra: serde_json::Value,
    ) -> Result<()> {
        let mut payload = serde_json::Map::new();
        payload.insert("source".into(), json!("worker"));
        payload.insert("failure_reason_code".into(), json!(failure_reason.as_str()));
        if failure_reason.is_recoverable() {
            for (key, value) in recoverable_payload_fields(&claimed.run_id, failure_reason) {
                payload.insert(key.to_string(), value);
            }
        }
        if let serde_json::Value::Object(extra) = extra {
            for (key, value) in extra {
                payload.insert(key, value);
            }
        }
        self.transition(
            conn,
            &claimed.run_id,
            current_status,
            RunState::Failed,
            Some(failure_reason),
            serde_json::Value::Object(payload),
        )
        .await?;
        self.leases
            .release(conn, &claimed.slot_id, Some(&claimed.run_id))
            .await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub(crate) fn leases(&self) -> &SlotLeaseManager {
        &self.leases
    }

    pub(crate) fn policy(&self) -> &ExecPolicy {
        &self.policy
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) async fn fail_run_now(
        &self,
        claimed: &ClaimedRun,
        failure_reason: FailureReasonCode,
        extra: serde_json::Value,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let status = self.current_status(&mut tx, &claimed.run_id).await?;
        self.finalize_failed(&mut tx, claimed, &status, failure_reason, extra)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Cooperative supervision wired to the database: cancel when the run row
/// says `canceled`, and surface heartbeat rejection as lease expiry.
struct WorkerProbe {
    pool: PgPool,
    leases: SlotLeaseManager,
    run_id: String,
    slot_id: String,
}

#[async_trait]
impl SupervisionProbe for WorkerProbe {
    async fn should_cancel(&mut self) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let run = runs::fetch_run(&mut conn, &self.run_id).await?;
        Ok(run.map(|r| r.status == RunState::Canceled.as_str()).unwrap_or(false))
    }

    async fn heartbeat(&mut self) -> Result<HeartbeatVerdict> {
        let mut tx = self.pool.begin().await?;
        let Some(run) = runs::fetch_run(&mut tx, &self.run_id).await? else {
            tx.rollback().await?;
            return Ok(HeartbeatVerdict::RunCanceled);
        };
        if run.status == RunState::Canceled.as_str() {
            tx.commit().await?;
            return Ok(HeartbeatVerdict::RunCanceled);
        }

        let outcome = self
            .leases
            .heartbeat(&mut tx, &self.slot_id, &self.run_id)
            .await?;
        tx.commit().await?;

        if outcome.heartbeat_updated {
            Ok(HeartbeatVerdict::Alive)
        } else if outcome.reason.as_deref() == Some("lease_expired") {
            Ok(HeartbeatVerdict::LeaseExpired)
        } else {
            // lease_released, lease_not_found, or another refusal: treat as
            // expiry, the run cannot keep the slot either way. A cancel is
            // caught by the run-status check above before it gets here.
            Ok(HeartbeatVerdict::LeaseExpired)
        }
    }
}
