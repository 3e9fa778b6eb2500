//! Commit-pinned merge-gate checks.
//!
//! Every configured check re-runs in the run's worktree with HEAD verified
//! against the recorded commit SHA before the first check and again after
//! every check. Any drift is a merge conflict, not a check failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgConnection;

use ovs_artifacts::ArtifactStore;
use ovs_config::Settings;
use ovs_db::events::{append_run_event, NewRunEvent};
use ovs_db::records::{insert_artifact, insert_check, NewArtifact, NewCheck};
use ovs_db::runs::RunRow;
use ovs_domain::{CoreError, CoreResult, FailureReasonCode};
use ovs_exec::{
    run_captured, run_supervised, CommandSpec, ExecOutcome, ExecPolicy, NoopProbe,
    SupervisionIntervals,
};

/// Gate verdict. `passed=false` carries the mapped failure reason, the check
/// that stopped the pipeline (when one did), and a machine-readable detail.
#[derive(Debug, Clone)]
pub struct MergeGateResult {
    pub passed: bool,
    pub failure_reason: Option<FailureReasonCode>,
    pub failed_check: Option<String>,
    pub detail: Option<String>,
}

impl MergeGateResult {
    fn pass() -> Self {
        MergeGateResult {
            passed: true,
            failure_reason: None,
            failed_check: None,
            detail: None,
        }
    }

    fn fail(
        reason: FailureReasonCode,
        failed_check: Option<&str>,
        detail: &str,
    ) -> Self {
        MergeGateResult {
            passed: false,
            failure_reason: Some(reason),
            failed_check: failed_check.map(str::to_string),
            detail: Some(detail.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct GateCheck {
    name: String,
    command: Vec<String>,
    timeout: Duration,
}

enum CheckLoad {
    Loaded(Vec<GateCheck>),
    MissingCommand(String),
}

fn load_checks(settings: &Settings) -> CheckLoad {
    let mut checks = Vec::new();
    for name in &settings.merge_gate.required_checks {
        let Some(command) = settings.merge_gate_check_command(name) else {
            return CheckLoad::MissingCommand(name.clone());
        };
        checks.push(GateCheck {
            name: name.clone(),
            command,
            timeout: settings.merge_gate_check_timeout(name),
        });
    }
    CheckLoad::Loaded(checks)
}

/// Run every configured gate check against the pinned commit.
pub async fn run_merge_gate_checks(
    conn: &mut PgConnection,
    settings: &Settings,
    run: &RunRow,
) -> CoreResult<MergeGateResult> {
    let Some(expected_commit) = run.commit_sha.as_deref() else {
        return Ok(MergeGateResult::fail(
            FailureReasonCode::MergeConflict,
            None,
            "missing_commit_sha",
        ));
    };
    let Some(worktree_path) = run.worktree_path.as_deref() else {
        return Ok(MergeGateResult::fail(
            FailureReasonCode::MergeConflict,
            None,
            "missing_worktree_path",
        ));
    };
    let worktree = PathBuf::from(worktree_path);

    if git_head(&worktree).await?.as_deref() != Some(expected_commit) {
        return Ok(MergeGateResult::fail(
            FailureReasonCode::MergeConflict,
            None,
            "head_sha_mismatch_before_checks",
        ));
    }

    let checks = match load_checks(settings) {
        CheckLoad::Loaded(checks) => checks,
        CheckLoad::MissingCommand(name) => {
            return Ok(MergeGateResult::fail(
                FailureReasonCode::ChecksFailed,
                Some(&name),
                "missing_check_command_configuration",
            ));
        }
    };

    let store = ArtifactStore::new(&settings.worker.artifact_root);

    for check in &checks {
        let log_path = store
            .merge_gate_log_path(&run.id, &check.name)
            .map_err(CoreError::Internal)?;
        let started_at = Utc::now();
        let outcome =
            run_gate_command(settings, &check.command, &worktree, check.timeout, &log_path)
                .await?;
        let ended_at = Utc::now();
        let artifact_uri = log_path.to_string_lossy().into_owned();

        let (status, failure_reason) = if outcome.timed_out {
            ("timed_out", Some(FailureReasonCode::AgentTimeout))
        } else if outcome.exit_code != Some(0) {
            ("failed", Some(FailureReasonCode::ChecksFailed))
        } else {
            ("passed", None)
        };

        insert_check(
            conn,
            &NewCheck {
                run_id: run.id.clone(),
                check_name: format!("merge_gate:{}", check.name),
                status: status.to_string(),
                started_at,
                ended_at,
                artifact_uri: Some(artifact_uri.clone()),
            },
        )
        .await?;
        insert_artifact(
            conn,
            &NewArtifact {
                run_id: run.id.clone(),
                artifact_type: "merge_gate_check_log".to_string(),
                artifact_uri: artifact_uri.clone(),
                metadata: Some(json!({
                    "check_name": check.name,
                    "command": check.command,
                    "status": status,
                    "exit_code": outcome.exit_code,
                    "timed_out": outcome.timed_out,
                    "expected_commit_sha": expected_commit,
                })),
            },
        )
        .await?;
        append_run_event(
            conn,
            NewRunEvent::new(&run.id, "merge_gate_check_finished")
                .with_payload(json!({
                    "check_name": check.name,
                    "status": status,
                    "artifact_uri": artifact_uri,
                    "command": check.command,
                    "exit_code": outcome.exit_code,
                    "timed_out": outcome.timed_out,
                    "expected_commit_sha": expected_commit,
                }))
                .with_actor(run.created_by.as_deref())
                .with_audit("run.test.final_check_completed"),
        )
        .await?;

        // Commit pin: any HEAD movement during a check poisons the gate.
        if git_head(&worktree).await?.as_deref() != Some(expected_commit) {
            return Ok(MergeGateResult::fail(
                FailureReasonCode::MergeConflict,
                Some(&check.name),
                "head_sha_changed_during_checks",
            ));
        }

        if let Some(reason) = failure_reason {
            return Ok(MergeGateResult::fail(reason, Some(&check.name), status));
        }
    }

    Ok(MergeGateResult::pass())
}

/// Run one gate command under the shared supervisor, timeout-only.
pub(crate) async fn run_gate_command(
    settings: &Settings,
    command: &[String],
    cwd: &Path,
    timeout: Duration,
    log_path: &Path,
) -> CoreResult<ExecOutcome> {
    let mut policy = ExecPolicy::from_settings(settings);
    // Gate commands run in the worktree or the repo root.
    policy.allowed_paths.push(settings.repo_root_path.clone());
    let spec = CommandSpec {
        command: command.to_vec(),
        cwd: cwd.to_path_buf(),
        timeout,
        output_path: log_path.to_path_buf(),
        injected_env: vec![],
    };
    run_supervised(&spec, &policy, &mut NoopProbe, SupervisionIntervals::timeout_only())
        .await
        .map_err(CoreError::Internal)
}

/// HEAD of a worktree, `None` when unreadable.
pub(crate) async fn git_head(worktree: &Path) -> CoreResult<Option<String>> {
    let output = run_captured(
        "git",
        &["-C", &worktree.to_string_lossy(), "rev-parse", "HEAD"],
        None,
    )
    .await
    .map_err(CoreError::Internal)?;
    if !output.success() {
        return Ok(None);
    }
    let head = output.stdout.trim().to_string();
    Ok((!head.is_empty()).then_some(head))
}
