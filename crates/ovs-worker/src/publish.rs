//! Preview publish pipeline and the slot integration probe.
//!
//! Publish steps are configured commands run in the worktree: frontend
//! install (skipped when the dependency cache already exists) and build,
//! artifact sync into the slot's web root, backend dependency sync,
//! migration, restart, and the two health probes. An unset command skips its
//! step so bare environments still complete the pipeline.

use serde_json::json;
use tracing::info;

use ovs_db::events::{append_run_event, NewRunEvent};
use ovs_db::records::{insert_artifact, NewArtifact};
use ovs_domain::FailureReasonCode;
use ovs_exec::{run_supervised, CommandSpec, NoopProbe, SupervisionIntervals};

use crate::{ClaimedRun, WorkerOrchestrator};

struct PublishStep<'a> {
    name: &'static str,
    command: &'a Option<Vec<String>>,
}

/// Run the publish pipeline. Returns false when the run was finalized.
pub(crate) async fn publish_preview(
    worker: &WorkerOrchestrator,
    claimed: &ClaimedRun,
    commit_sha: &str,
) -> anyhow::Result<bool> {
    let publish = &worker.settings().worker.publish;
    let steps = [
        PublishStep { name: "frontend-install", command: &publish.frontend_install_command },
        PublishStep { name: "frontend-build", command: &publish.frontend_build_command },
        PublishStep { name: "sync", command: &publish.sync_command },
        PublishStep { name: "backend-sync", command: &publish.backend_sync_command },
        PublishStep { name: "backend-migrate", command: &publish.backend_migrate_command },
        PublishStep { name: "backend-restart", command: &publish.backend_restart_command },
        PublishStep { name: "frontend-health", command: &publish.frontend_healthcheck_command },
        PublishStep { name: "backend-health", command: &publish.backend_healthcheck_command },
    ];

    let mut log_uris: Vec<String> = Vec::new();

    for step in steps {
        let Some(command) = step.command else {
            let mut tx = worker.pool().begin().await?;
            append_run_event(
                &mut tx,
                NewRunEvent::new(&claimed.run_id, "preview_publish_step_skipped").with_payload(
                    json!({"source": "worker", "step": step.name, "reason": "no_command_configured"}),
                ),
            )
            .await?;
            tx.commit().await?;
            continue;
        };

        // Dependency install only runs on a cold cache.
        if step.name == "frontend-install" {
            if let Some(cache_dir) = &publish.frontend_cache_dir {
                if cache_dir.is_dir() {
                    let mut tx = worker.pool().begin().await?;
                    append_run_event(
                        &mut tx,
                        NewRunEvent::new(&claimed.run_id, "preview_publish_step_skipped")
                            .with_payload(json!({
                                "source": "worker",
                                "step": step.name,
                                "reason": "dependency_cache_present",
                            })),
                    )
                    .await?;
                    tx.commit().await?;
                    continue;
                }
            }
        }

        let log_path = worker.store().publish_log_path(&claimed.run_id, step.name)?;
        let spec = CommandSpec {
            command: command.clone(),
            cwd: claimed.worktree_path.clone(),
            timeout: publish.step_timeout,
            output_path: log_path.clone(),
            injected_env: vec![
                ("RUN_ID".to_string(), claimed.run_id.clone()),
                ("SLOT_ID".to_string(), claimed.slot_id.clone()),
                ("TRACE_ID".to_string(), claimed.trace_id.clone()),
                ("COMMIT_SHA".to_string(), commit_sha.to_string()),
            ],
        };
        let outcome = run_supervised(
            &spec,
            worker.policy(),
            &mut NoopProbe,
            SupervisionIntervals::timeout_only(),
        )
        .await?;
        let artifact_uri = log_path.to_string_lossy().into_owned();
        log_uris.push(artifact_uri.clone());

        let mut tx = worker.pool().begin().await?;
        insert_artifact(
            &mut tx,
            &NewArtifact {
                run_id: claimed.run_id.clone(),
                artifact_type: "preview_publish_log".to_string(),
                artifact_uri: artifact_uri.clone(),
                metadata: Some(json!({
                    "step": step.name,
                    "command": command,
                    "exit_code": outcome.exit_code,
                    "timed_out": outcome.timed_out,
                })),
            },
        )
        .await?;
        append_run_event(
            &mut tx,
            NewRunEvent::new(&claimed.run_id, "preview_publish_step_finished").with_payload(
                json!({
                    "source": "worker",
                    "step": step.name,
                    "exit_code": outcome.exit_code,
                    "timed_out": outcome.timed_out,
                    "artifact_uri": artifact_uri,
                }),
            ),
        )
        .await?;
        tx.commit().await?;

        if !outcome.clean() {
            worker
                .fail_run_now(
                    claimed,
                    FailureReasonCode::PreviewPublishFailed,
                    json!({
                        "step": step.name,
                        "exit_code": outcome.exit_code,
                        "timed_out": outcome.timed_out,
                        "step_log_uris": log_uris,
                    }),
                )
                .await?;
            return Ok(false);
        }
    }

    info!(run_id = %claimed.run_id, slot_id = %claimed.slot_id, "preview published");
    Ok(true)
}

/// Verify the slot-local surface through the HTTP API: `/health` answers and
/// `/api/slots` shows this slot leased to this run. Returns false when the
/// run was finalized.
pub(crate) async fn slot_integration_probe(
    worker: &WorkerOrchestrator,
    claimed: &ClaimedRun,
) -> anyhow::Result<bool> {
    let base = worker.settings().worker.api_base_url.trim_end_matches('/').to_string();

    let probe_result = probe_slot_api(worker, claimed, &base).await;
    let (passed, detail) = match probe_result {
        Ok(()) => (true, None),
        Err(detail) => (false, Some(detail)),
    };

    let mut tx = worker.pool().begin().await?;
    append_run_event(
        &mut tx,
        NewRunEvent::new(&claimed.run_id, "slot_integration_probe").with_payload(json!({
            "source": "worker",
            "slot_id": claimed.slot_id,
            "passed": passed,
            "detail": detail,
            "api_base_url": base,
        })),
    )
    .await?;
    tx.commit().await?;

    if !passed {
        worker
            .fail_run_now(
                claimed,
                FailureReasonCode::ChecksFailed,
                json!({"detail": detail, "check_name": "slot_integration_probe"}),
            )
            .await?;
        return Ok(false);
    }
    Ok(true)
}

async fn probe_slot_api(
    worker: &WorkerOrchestrator,
    claimed: &ClaimedRun,
    base: &str,
) -> Result<(), String> {
    let health = worker
        .http()
        .get(format!("{base}/health"))
        .send()
        .await
        .map_err(|err| format!("health_unreachable:{err}"))?;
    if !health.status().is_success() {
        return Err(format!("health_status:{}", health.status().as_u16()));
    }

    let slots = worker
        .http()
        .get(format!("{base}/api/slots"))
        .send()
        .await
        .map_err(|err| format!("slots_unreachable:{err}"))?;
    if !slots.status().is_success() {
        return Err(format!("slots_status:{}", slots.status().as_u16()));
    }
    let rows: serde_json::Value = slots
        .json()
        .await
        .map_err(|err| format!("slots_body_invalid:{err}"))?;

    let row = rows
        .as_array()
        .and_then(|rows| {
            rows.iter().find(|row| {
                row.get("slot_id").and_then(serde_json::Value::as_str)
                    == Some(claimed.slot_id.as_str())
            })
        })
        .ok_or_else(|| format!("slot_row_missing:{}", claimed.slot_id))?;

    let run_id = row.get("run_id").and_then(serde_json::Value::as_str);
    if run_id != Some(claimed.run_id.as_str()) {
        return Err(format!(
            "slot_row_run_mismatch:expected={}:actual={}",
            claimed.run_id,
            run_id.unwrap_or("null")
        ));
    }
    Ok(())
}
