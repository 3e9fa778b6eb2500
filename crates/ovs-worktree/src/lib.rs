//! Worktree binding manager.
//!
//! Associates a slot with a run's branch and checked-out directory, both on
//! disk (`git worktree`) and in the `slot_worktree_bindings` table. One
//! binding per slot; assignment requires a live lease owned by the run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;
use sqlx::PgConnection;

use ovs_config::Settings;
use ovs_db::bindings;
use ovs_db::events::{append_run_event, NewRunEvent};
use ovs_db::runs;
use ovs_domain::{CoreError, CoreResult};
use ovs_exec::run_captured;
use ovs_slots::SlotLeaseManager;

pub const BRANCH_PREFIX: &str = "codex/run-";

#[derive(Debug, Clone, Serialize)]
pub struct AssignOutcome {
    pub assigned: bool,
    pub reused: bool,
    pub slot_id: String,
    pub run_id: String,
    pub branch_name: String,
    pub worktree_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutcome {
    pub cleaned: bool,
    pub slot_id: String,
    pub run_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchDeleteOutcome {
    pub deleted: bool,
    pub branch_name: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorktreeBindingState {
    pub slot_id: String,
    pub state: String,
    pub run_id: Option<String>,
    pub branch_name: Option<String>,
    pub worktree_path: Option<String>,
    pub binding_state: Option<String>,
    pub last_action: Option<String>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Branch name for a run. Run ids are restricted so the ref name is safe.
pub fn branch_name_for_run(run_id: &str) -> CoreResult<String> {
    let valid = !run_id.is_empty()
        && run_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(CoreError::ValidationError(
            "invalid_run_id_for_branch".to_string(),
        ));
    }
    Ok(format!("{BRANCH_PREFIX}{run_id}"))
}

/// One registered worktree from `git worktree list --porcelain`.
#[derive(Debug, Clone, Default)]
struct RegisteredWorktree {
    branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_root: PathBuf,
    slot_ids: Vec<String>,
    leases: SlotLeaseManager,
}

impl WorktreeManager {
    pub fn new(settings: &Settings) -> Self {
        WorktreeManager {
            repo_root: settings.repo_root_path.clone(),
            worktree_root: settings.worktree_root_path.clone(),
            slot_ids: settings.slot_ids.clone(),
            leases: SlotLeaseManager::new(settings),
        }
    }

    fn validate_slot(&self, slot_id: &str) -> CoreResult<()> {
        if self.slot_ids.iter().any(|s| s == slot_id) {
            Ok(())
        } else {
            Err(CoreError::ValidationError("invalid_slot_id".to_string()))
        }
    }

    fn ensure_repo_root(&self) -> CoreResult<()> {
        if self.repo_root.join(".git").exists() {
            Ok(())
        } else {
            Err(CoreError::ConfigurationError("repo_root_not_found".to_string()))
        }
    }

    /// `<worktree_root>/<slot_id>`, rejected when it resolves outside the
    /// root (symlink escape included).
    fn slot_worktree_path(&self, slot_id: &str) -> CoreResult<PathBuf> {
        std::fs::create_dir_all(&self.worktree_root).map_err(|err| {
            CoreError::Internal(anyhow::Error::new(err).context("create worktree root"))
        })?;
        let root = self.worktree_root.canonicalize().map_err(|err| {
            CoreError::Internal(anyhow::Error::new(err).context("resolve worktree root"))
        })?;
        let candidate = root.join(slot_id);
        let resolved = if candidate.exists() {
            candidate.canonicalize().map_err(|err| {
                CoreError::Internal(anyhow::Error::new(err).context("resolve worktree path"))
            })?
        } else {
            candidate
        };
        if resolved != root && !resolved.starts_with(&root) {
            return Err(CoreError::ConfigurationError(
                "worktree_path_out_of_bounds".to_string(),
            ));
        }
        Ok(resolved)
    }

    /// Bind `slot_id` to `run_id`: reuse the existing worktree when it is
    /// already this run's branch, otherwise evict the occupant, create the
    /// branch if missing, and add the worktree.
    pub async fn assign(
        &self,
        conn: &mut PgConnection,
        run_id: &str,
        slot_id: &str,
    ) -> CoreResult<AssignOutcome> {
        self.validate_slot(slot_id)?;
        let run = runs::fetch_run(conn, run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run_not_found"))?;
        self.leases.ensure_active_lease(conn, slot_id, run_id).await?;

        let branch_name = branch_name_for_run(run_id)?;
        if let Some(existing) = &run.branch_name {
            if existing != &branch_name {
                return Err(CoreError::ResourceConflict("branch_name_conflict".to_string()));
            }
        }
        if let Some(existing) = &run.slot_id {
            if existing != slot_id {
                return Err(CoreError::ResourceConflict("run_bound_to_other_slot".to_string()));
            }
        }

        self.ensure_repo_root()?;
        let worktree_path = self.slot_worktree_path(slot_id)?;
        let resolved = worktree_path.to_string_lossy().into_owned();

        let mut registered = self.list_registered_worktrees().await?;
        let binding = bindings::fetch_binding_for_update(conn, slot_id).await?;

        let bound_to_run = binding
            .as_ref()
            .map(|b| {
                b.run_id.as_deref() == Some(run_id) && b.binding_state == bindings::ACTIVE
            })
            .unwrap_or(false);

        let mut reused = registered
            .get(&resolved)
            .and_then(|w| w.branch.as_deref())
            == Some(branch_name.as_str())
            && bound_to_run;

        if !reused {
            // Evict an unrelated worktree occupying the path.
            if let Some(existing) = registered.get(&resolved) {
                if existing.branch.as_deref() != Some(branch_name.as_str()) {
                    self.git(&["worktree", "remove", "--force", &resolved]).await?;
                }
            }

            self.ensure_branch_exists(&branch_name).await?;
            registered = self.list_registered_worktrees().await?;
            if registered
                .get(&resolved)
                .and_then(|w| w.branch.as_deref())
                == Some(branch_name.as_str())
            {
                reused = true;
            } else {
                self.git(&["worktree", "add", &resolved, &branch_name]).await?;
            }
        }

        let last_action = if reused { "reused" } else { "assigned" };
        bindings::upsert_binding(
            conn,
            &bindings::NewBinding {
                slot_id: slot_id.to_string(),
                run_id: run_id.to_string(),
                branch_name: branch_name.clone(),
                worktree_path: resolved.clone(),
                last_action: last_action.to_string(),
            },
        )
        .await?;
        runs::set_run_workspace(conn, run_id, Some(slot_id), Some(&branch_name), Some(&resolved))
            .await?;

        let payload = json!({
            "slot_id": slot_id,
            "run_id": run_id,
            "branch_name": branch_name,
            "worktree_path": resolved,
            "reused": reused,
        });
        let (event_type, audit_action) = if reused {
            ("worktree_reused", "worktree.reuse")
        } else {
            ("worktree_assigned", "worktree.assign")
        };
        append_run_event(
            conn,
            NewRunEvent::new(run_id, event_type)
                .with_payload(payload)
                .with_actor(run.created_by.as_deref())
                .with_audit(audit_action),
        )
        .await?;

        Ok(AssignOutcome {
            assigned: true,
            reused,
            slot_id: slot_id.to_string(),
            run_id: run_id.to_string(),
            branch_name,
            worktree_path: resolved,
        })
    }

    /// Remove the slot's worktree and release the binding. Wrong run ids are
    /// soft no-ops so cleanup can be fired defensively.
    pub async fn cleanup(
        &self,
        conn: &mut PgConnection,
        slot_id: &str,
        run_id: Option<&str>,
    ) -> CoreResult<CleanupOutcome> {
        self.validate_slot(slot_id)?;

        let binding = bindings::fetch_binding_for_update(conn, slot_id).await?;
        let Some(binding) = binding.filter(|b| b.binding_state == bindings::ACTIVE) else {
            return Ok(CleanupOutcome {
                cleaned: false,
                slot_id: slot_id.to_string(),
                run_id: run_id.map(str::to_string),
                branch_name: None,
                worktree_path: None,
                reason: Some("no_active_binding".to_string()),
            });
        };

        if let Some(run_id) = run_id {
            if binding.run_id.as_deref() != Some(run_id) {
                return Ok(CleanupOutcome {
                    cleaned: false,
                    slot_id: slot_id.to_string(),
                    run_id: Some(run_id.to_string()),
                    branch_name: None,
                    worktree_path: None,
                    reason: Some("slot_bound_to_other_run".to_string()),
                });
            }
        }

        self.ensure_repo_root()?;

        let worktree_path = binding.worktree_path.clone().unwrap_or_default();
        let registered = self.list_registered_worktrees().await?;
        if registered.contains_key(&worktree_path) {
            self.git(&["worktree", "remove", "--force", &worktree_path]).await?;
        }

        bindings::release_binding(conn, slot_id, "cleaned_up").await?;

        let owning_run_id = binding.run_id.clone();
        if let Some(owner) = &owning_run_id {
            runs::clear_run_worktree(conn, owner, slot_id, &worktree_path).await?;
        }

        let payload = json!({
            "slot_id": slot_id,
            "run_id": owning_run_id,
            "branch_name": binding.branch_name,
            "worktree_path": binding.worktree_path,
        });
        if let Some(owner) = &owning_run_id {
            append_run_event(
                conn,
                NewRunEvent::new(owner, "worktree_cleaned")
                    .with_payload(payload.clone())
                    .with_audit("worktree.cleanup"),
            )
            .await?;
        }

        Ok(CleanupOutcome {
            cleaned: true,
            slot_id: slot_id.to_string(),
            run_id: owning_run_id,
            branch_name: binding.branch_name.clone(),
            worktree_path: binding.worktree_path.clone(),
            reason: None,
        })
    }

    /// Delete a run's branch from the repo root (used on rejection).
    pub async fn delete_run_branch(&self, run_id: &str) -> CoreResult<BranchDeleteOutcome> {
        let branch_name = branch_name_for_run(run_id)?;
        self.ensure_repo_root()?;

        let exists = run_captured(
            "git",
            &[
                "-C",
                &self.repo_root.to_string_lossy(),
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch_name}"),
            ],
            None,
        )
        .await
        .map_err(CoreError::Internal)?;
        if !exists.success() {
            return Ok(BranchDeleteOutcome {
                deleted: false,
                branch_name,
                reason: Some("branch_not_found".to_string()),
            });
        }

        let deleted = self.git(&["branch", "-D", &branch_name]).await;
        match deleted {
            Ok(_) => Ok(BranchDeleteOutcome {
                deleted: true,
                branch_name,
                reason: None,
            }),
            Err(err) => Ok(BranchDeleteOutcome {
                deleted: false,
                branch_name,
                reason: Some(err.to_string()),
            }),
        }
    }

    /// One row per configured slot.
    pub async fn list_bindings(
        &self,
        conn: &mut PgConnection,
    ) -> CoreResult<Vec<WorktreeBindingState>> {
        let rows = bindings::list_bindings(conn, &self.slot_ids).await?;
        let mut out = Vec::with_capacity(self.slot_ids.len());
        for slot_id in &self.slot_ids {
            let Some(binding) = rows.iter().find(|b| &b.slot_id == slot_id) else {
                out.push(WorktreeBindingState {
                    slot_id: slot_id.clone(),
                    state: "unbound".to_string(),
                    run_id: None,
                    branch_name: None,
                    worktree_path: None,
                    binding_state: None,
                    last_action: None,
                    updated_at: None,
                });
                continue;
            };
            out.push(WorktreeBindingState {
                slot_id: slot_id.clone(),
                state: if binding.binding_state == bindings::ACTIVE {
                    "bound".to_string()
                } else {
                    "released".to_string()
                },
                run_id: binding.run_id.clone(),
                branch_name: binding.branch_name.clone(),
                worktree_path: binding.worktree_path.clone(),
                binding_state: Some(binding.binding_state.clone()),
                last_action: Some(binding.last_action.clone()),
                updated_at: Some(binding.updated_at),
            });
        }
        Ok(out)
    }

    async fn ensure_branch_exists(&self, branch_name: &str) -> CoreResult<()> {
        let exists = run_captured(
            "git",
            &[
                "-C",
                &self.repo_root.to_string_lossy(),
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch_name}"),
            ],
            None,
        )
        .await
        .map_err(CoreError::Internal)?;
        if exists.success() {
            return Ok(());
        }
        self.git(&["branch", branch_name]).await?;
        Ok(())
    }

    async fn list_registered_worktrees(
        &self,
    ) -> CoreResult<HashMap<String, RegisteredWorktree>> {
        let output = run_captured(
            "git",
            &[
                "-C",
                &self.repo_root.to_string_lossy(),
                "worktree",
                "list",
                "--porcelain",
            ],
            None,
        )
        .await
        .map_err(CoreError::Internal)?;
        if !output.success() {
            return Ok(HashMap::new());
        }
        Ok(parse_worktree_porcelain(&output.stdout))
    }

    /// Run a git subcommand at the repo root, failing with the captured
    /// stderr as a named error.
    async fn git(&self, args: &[&str]) -> CoreResult<String> {
        let repo = self.repo_root.to_string_lossy().into_owned();
        let mut full: Vec<&str> = vec!["-C", &repo];
        full.extend_from_slice(args);
        let output = run_captured("git", &full, None)
            .await
            .map_err(CoreError::Internal)?;
        if !output.success() {
            let message = output.message();
            let message = if message.is_empty() { "unknown_error".to_string() } else { message };
            return Err(CoreError::SubprocessFailure(format!(
                "git_command_failed:{message}"
            )));
        }
        Ok(output.stdout)
    }
}

fn parse_worktree_porcelain(stdout: &str) -> HashMap<String, RegisteredWorktree> {
    let mut items: HashMap<String, RegisteredWorktree> = HashMap::new();
    let mut current: Option<String> = None;
    for raw in stdout.lines() {
        let line = raw.trim();
        if line.is_empty() {
            current = None;
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            let resolved = Path::new(path.trim())
                .canonicalize()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| path.trim().to_string());
            items.insert(resolved.clone(), RegisteredWorktree::default());
            current = Some(resolved);
            continue;
        }
        let Some(key) = &current else { continue };
        if let Some(branch_ref) = line.strip_prefix("branch ") {
            if let Some(entry) = items.get_mut(key) {
                entry.branch = Some(
                    branch_ref
                        .trim()
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch_ref.trim())
                        .to_string(),
                );
            }
        }
    }
    items
}

/// Static contract served by `GET /api/worktrees/contract`.
pub fn worktree_contract() -> serde_json::Value {
    json!({
        "branch_name_pattern": format!("{BRANCH_PREFIX}<run_id>"),
        "slot_binding_policy": "one_worktree_per_slot_with_persisted_binding",
        "operations": ["assign", "reuse", "cleanup"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_are_prefixed_and_validated() {
        assert_eq!(
            branch_name_for_run("1234-abcd").unwrap(),
            "codex/run-1234-abcd"
        );
        assert!(branch_name_for_run("../evil").is_err());
        assert!(branch_name_for_run("a b").is_err());
        assert!(branch_name_for_run("").is_err());
    }

    #[test]
    fn porcelain_parsing_reads_branches() {
        let out = "worktree /tmp/definitely-missing-root\nHEAD abc123\nbranch refs/heads/main\n\nworktree /tmp/definitely-missing-wt\nHEAD def456\nbranch refs/heads/codex/run-xyz\n\n";
        let items = parse_worktree_porcelain(out);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items["/tmp/definitely-missing-wt"].branch.as_deref(),
            Some("codex/run-xyz")
        );
    }
}
