//! Preview database reset, recorded in `preview_db_resets`.
//!
//! The reset itself is an external script; the core records intent and
//! outcome. A failed reset fails the run with `MIGRATION_FAILED` and frees
//! the slot.

use serde_json::json;

use ovs_db::events::{append_run_event, NewRunEvent};
use ovs_db::records::{complete_preview_db_reset, insert_preview_db_reset, NewPreviewDbReset};
use ovs_domain::FailureReasonCode;
use ovs_exec::{run_supervised, CommandSpec, NoopProbe, SupervisionIntervals};

use crate::{ClaimedRun, WorkerOrchestrator};

const DEFAULT_STRATEGY: &str = "seed";
const DEFAULT_SEED_VERSION: &str = "v1";

/// Preview database name for a slot: `app_preview_<n>` for the standard
/// `preview-<n>` ids, a sanitized suffix otherwise.
pub(crate) fn preview_db_name(slot_id: &str) -> String {
    let suffix = slot_id.rsplit('-').next().unwrap_or(slot_id);
    if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
        return format!("app_preview_{suffix}");
    }
    let sanitized: String = slot_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("app_preview_{sanitized}")
}

/// Run the reset/seed step for a freshly claimed run. Returns false when the
/// cycle ended (run failed, lease released).
pub(crate) async fn run_preview_db_reset(
    worker: &WorkerOrchestrator,
    claimed: &ClaimedRun,
) -> anyhow::Result<bool> {
    let Some(command) = worker.settings().worker.preview_reset_command.clone() else {
        let mut tx = worker.pool().begin().await?;
        append_run_event(
            &mut tx,
            NewRunEvent::new(&claimed.run_id, "preview_db_reset_skipped").with_payload(json!({
                "source": "worker",
                "slot_id": claimed.slot_id,
                "reason": "no_command_configured",
            })),
        )
        .await?;
        tx.commit().await?;
        return Ok(true);
    };

    let db_name = preview_db_name(&claimed.slot_id);
    let mut tx = worker.pool().begin().await?;
    let reset_id = insert_preview_db_reset(
        &mut tx,
        &NewPreviewDbReset {
            run_id: claimed.run_id.clone(),
            slot_id: claimed.slot_id.clone(),
            db_name: db_name.clone(),
            strategy: DEFAULT_STRATEGY.to_string(),
            seed_version: Some(DEFAULT_SEED_VERSION.to_string()),
            snapshot_version: None,
        },
    )
    .await?;
    tx.commit().await?;

    let mut full_command = command;
    full_command.extend(
        [
            "--slot",
            &claimed.slot_id,
            "--run-id",
            &claimed.run_id,
            "--strategy",
            DEFAULT_STRATEGY,
            "--seed-version",
            DEFAULT_SEED_VERSION,
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    let log_path = worker.store().publish_log_path(&claimed.run_id, "db-reset")?;
    let spec = CommandSpec {
        command: full_command.clone(),
        cwd: claimed.worktree_path.clone(),
        timeout: worker.settings().worker.publish.step_timeout,
        output_path: log_path,
        injected_env: vec![
            ("RUN_ID".to_string(), claimed.run_id.clone()),
            ("SLOT_ID".to_string(), claimed.slot_id.clone()),
            ("TRACE_ID".to_string(), claimed.trace_id.clone()),
        ],
    };
    let outcome = run_supervised(
        &spec,
        worker.policy(),
        &mut NoopProbe,
        SupervisionIntervals::timeout_only(),
    )
    .await?;

    let mut tx = worker.pool().begin().await?;
    if outcome.clean() {
        complete_preview_db_reset(
            &mut tx,
            reset_id,
            "completed",
            &json!({
                "slot_id": claimed.slot_id,
                "db_name": db_name,
                "strategy": DEFAULT_STRATEGY,
                "seed_version": DEFAULT_SEED_VERSION,
                "command": full_command,
            }),
        )
        .await?;
        tx.commit().await?;
        return Ok(true);
    }

    complete_preview_db_reset(
        &mut tx,
        reset_id,
        "failed",
        &json!({
            "slot_id": claimed.slot_id,
            "db_name": db_name,
            "exit_code": outcome.exit_code,
            "timed_out": outcome.timed_out,
            "output_excerpt": outcome.output_excerpt,
        }),
    )
    .await?;
    append_run_event(
        &mut tx,
        NewRunEvent::new(&claimed.run_id, "preview_db_reset_failed").with_payload(json!({
            "source": "worker",
            "slot_id": claimed.slot_id,
            "db_name": db_name,
            "exit_code": outcome.exit_code,
            "timed_out": outcome.timed_out,
        })),
    )
    .await?;
    tx.commit().await?;

    worker
        .fail_run_now(
            claimed,
            FailureReasonCode::MigrationFailed,
            json!({"detail": "preview_db_reset_failed", "slot_id": claimed.slot_id}),
        )
        .await?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::preview_db_name;

    #[test]
    fn db_names_follow_slot_numbers() {
        assert_eq!(preview_db_name("preview-1"), "app_preview_1");
        assert_eq!(preview_db_name("preview-3"), "app_preview_3");
        assert_eq!(preview_db_name("edge"), "app_preview_edge");
    }
}
