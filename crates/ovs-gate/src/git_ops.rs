//! Trunk merge and guarded push.

use chrono::Utc;
use tokio::time::timeout;

use ovs_config::{PushMode, Settings};
use ovs_db::runs::RunRow;
use ovs_domain::{CoreError, CoreResult};
use ovs_exec::run_captured;

pub enum MergeOutcome {
    Merged { merged_sha: String },
    Failed { detail: String },
}

/// `rel-<run_id_prefix>-<unix_ts>`.
pub fn release_id_for_run(run_id: &str) -> String {
    let prefix: String = run_id.chars().take(8).collect();
    format!("rel-{prefix}-{}", Utc::now().timestamp())
}

async fn git(repo: &str, args: &[&str]) -> CoreResult<ovs_exec::CapturedOutput> {
    let mut full: Vec<&str> = vec!["-C", repo];
    full.extend_from_slice(args);
    run_captured("git", &full, None).await.map_err(CoreError::Internal)
}

/// Merge the run's commit into trunk with a merge commit, switching branches
/// explicitly and restoring the prior branch whether or not the merge
/// succeeds. A conflict aborts the merge.
pub async fn merge_run_commit_to_trunk(
    settings: &Settings,
    run: &RunRow,
) -> CoreResult<MergeOutcome> {
    let Some(commit_sha) = run.commit_sha.as_deref() else {
        return Ok(MergeOutcome::Failed {
            detail: "missing_commit_sha".to_string(),
        });
    };

    let repo = settings.repo_root_path.to_string_lossy().into_owned();
    if !settings.repo_root_path.join(".git").exists() {
        return Ok(MergeOutcome::Failed {
            detail: "repo_root_not_found".to_string(),
        });
    }

    let previous = git(&repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let previous_branch = previous
        .success()
        .then(|| previous.stdout.trim().to_string())
        .filter(|b| !b.is_empty());

    let switch = git(&repo, &["switch", &settings.trunk_branch]).await?;
    if !switch.success() {
        return Ok(MergeOutcome::Failed {
            detail: or_default(&switch.message(), "switch_trunk_failed"),
        });
    }

    let merge = git(&repo, &["merge", "--no-ff", "--no-edit", commit_sha]).await?;
    if !merge.success() {
        git(&repo, &["merge", "--abort"]).await.ok();
        restore_branch(&repo, previous_branch.as_deref()).await;
        return Ok(MergeOutcome::Failed {
            detail: or_default(&merge.message(), "merge_failed"),
        });
    }

    let head = git(&repo, &["rev-parse", "HEAD"]).await?;
    let merged_sha = head
        .success()
        .then(|| head.stdout.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| commit_sha.to_string());

    restore_branch(&repo, previous_branch.as_deref()).await;

    Ok(MergeOutcome::Merged { merged_sha })
}

async fn restore_branch(repo: &str, branch: Option<&str>) {
    if let Some(branch) = branch {
        let _ = git(repo, &["switch", branch]).await;
    }
}

fn or_default(message: &str, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message.trim().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub pushed: bool,
    pub detail: Option<String>,
    pub rollback_guidance: Option<String>,
}

impl PushOutcome {
    /// The remote moved ahead of the local branch; pushing would rewrite it.
    pub fn not_fast_forward(detail: String) -> Self {
        PushOutcome::failed(format!("push_not_fast_forward:{detail}"))
    }

    fn failed(detail: String) -> Self {
        PushOutcome {
            pushed: false,
            detail: Some(detail),
            rollback_guidance: Some(
                "remote trunk was not modified; inspect the remote branch, then retry the \
                 push manually once the remote is a strict ancestor of the local branch"
                    .to_string(),
            ),
        }
    }
}

/// Push trunk to the configured remote under a strict non-FF guard:
/// `fetch --prune`, verify the remote branch is an ancestor of the local
/// branch, then `push [--dry-run]`.
pub async fn push_trunk_guarded(settings: &Settings) -> CoreResult<PushOutcome> {
    let gate = &settings.merge_gate;
    let repo = settings.repo_root_path.to_string_lossy().into_owned();
    let remote_ref = format!("{}/{}", gate.push_remote, gate.push_branch);

    let run_step = |args: Vec<String>| {
        let repo = repo.clone();
        async move {
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            git(&repo, &arg_refs).await
        }
    };

    let fetch = match timeout(
        gate.push_timeout,
        run_step(vec!["fetch".into(), "--prune".into(), gate.push_remote.clone()]),
    )
    .await
    {
        Err(_) => return Ok(PushOutcome::failed("fetch_timed_out".to_string())),
        Ok(result) => result?,
    };
    if !fetch.success() {
        return Ok(PushOutcome::failed(format!(
            "fetch_failed:{}",
            fetch.message()
        )));
    }

    // Non-FF guard: the remote branch must already be contained in ours.
    let ancestor = git(
        &repo,
        &["merge-base", "--is-ancestor", &remote_ref, &gate.push_branch],
    )
    .await?;
    if !ancestor.success() {
        return Err(CoreError::PushNotFastForward(format!(
            "remote_not_ancestor:{remote_ref}"
        )));
    }

    let mut push_args: Vec<String> = vec!["push".into()];
    if gate.push_mode == PushMode::DryRun {
        push_args.push("--dry-run".into());
    }
    push_args.push(gate.push_remote.clone());
    push_args.push(gate.push_branch.clone());

    let push = match timeout(gate.push_timeout, run_step(push_args)).await {
        Err(_) => return Ok(PushOutcome::failed("push_timed_out".to_string())),
        Ok(result) => result?,
    };
    if !push.success() {
        return Ok(PushOutcome::failed(format!("push_failed:{}", push.message())));
    }

    Ok(PushOutcome {
        pushed: true,
        detail: Some(if gate.push_mode == PushMode::DryRun {
            "dry_run_ok".to_string()
        } else {
            "pushed".to_string()
        }),
        rollback_guidance: None,
    })
}
