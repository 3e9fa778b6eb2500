//! Host-native maintenance jobs.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use ovs_config::{split_command, Settings};
use ovs_db::records::{list_releases, PreviewDbResetRow};
use ovs_exec::run_captured;
use ovs_slots::SlotLeaseManager;

use crate::JobCmd;

pub(crate) async fn run_job(cmd: JobCmd) -> Result<ExitCode> {
    let settings = Settings::from_env().context("load settings")?;
    let pool = ovs_db::connect(&settings.database_url).await?;

    match cmd {
        JobCmd::StaleLeaseCleanup => {
            let payload = stale_lease_cleanup(&pool, &settings).await?;
            println!("{payload}");
            Ok(ExitCode::SUCCESS)
        }
        JobCmd::PreviewResetIntegrity {
            lookback_hours,
            running_grace_minutes,
        } => {
            let audit =
                preview_reset_integrity(&pool, lookback_hours, running_grace_minutes).await?;
            let failed = audit["status"] == json!("failed");
            println!("{audit}");
            Ok(if failed { ExitCode::from(2) } else { ExitCode::SUCCESS })
        }
        JobCmd::DailyHealthSummary {
            output_dir,
            runtime_health_cmd,
            release_limit,
            lookback_hours,
            running_grace_minutes,
        } => {
            let (payload, ok) = daily_health_summary(
                &pool,
                &settings,
                &output_dir,
                runtime_health_cmd.as_deref(),
                release_limit,
                lookback_hours,
                running_grace_minutes,
            )
            .await?;
            println!("{payload}");
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::from(2) })
        }
    }
}

async fn stale_lease_cleanup(pool: &sqlx::PgPool, settings: &Settings) -> Result<Value> {
    let leases = SlotLeaseManager::new(settings);
    let mut tx = pool.begin().await?;
    let reap = leases.reap_expired(&mut tx).await?;
    tx.commit().await?;

    Ok(json!({
        "job": "stale_lease_cleanup",
        "generated_at": Utc::now().to_rfc3339(),
        "expired_count": reap.expired_count,
        "expired_slots": reap.expired_slots,
    }))
}

async fn preview_reset_integrity(
    pool: &sqlx::PgPool,
    lookback_hours: i64,
    running_grace_minutes: i64,
) -> Result<Value> {
    let generated_at = Utc::now();
    let window_start = generated_at - Duration::hours(lookback_hours.max(1));
    let running_stale_before = generated_at - Duration::minutes(running_grace_minutes.max(1));

    let mut conn = pool.acquire().await?;
    let records = ovs_db::records::list_resets_since(&mut conn, window_start).await?;

    let mut counts: BTreeMap<&str, i64> = BTreeMap::from([
        ("total", records.len() as i64),
        ("completed", 0),
        ("failed", 0),
        ("running", 0),
        ("running_stale", 0),
        ("completed_missing_completed_at", 0),
        ("completed_missing_details", 0),
    ]);
    let mut issues: Vec<String> = Vec::new();
    let mut latest_by_slot: Vec<Value> = Vec::new();
    let mut seen_slots: Vec<String> = Vec::new();

    for record in &records {
        match record.reset_status.as_str() {
            "completed" => *counts.entry("completed").or_default() += 1,
            "failed" | "error" => *counts.entry("failed").or_default() += 1,
            "running" => *counts.entry("running").or_default() += 1,
            _ => {}
        }
        if record.reset_status == "running" && record.reset_started_at <= running_stale_before {
            *counts.entry("running_stale").or_default() += 1;
        }
        if record.reset_status == "completed" && record.reset_completed_at.is_none() {
            *counts.entry("completed_missing_completed_at").or_default() += 1;
        }
        if record.reset_status == "completed" && record.details.is_none() {
            *counts.entry("completed_missing_details").or_default() += 1;
        }
        if !seen_slots.contains(&record.slot_id) {
            seen_slots.push(record.slot_id.clone());
            latest_by_slot.push(latest_entry(record));
        }
    }

    let status = if counts["total"] == 0 {
        issues.push("No preview reset records in lookback window.".to_string());
        "no_data"
    } else {
        let mut status = "passed";
        if counts["failed"] > 0 {
            status = "failed";
            issues.push(format!("Detected {} failed preview reset records.", counts["failed"]));
        }
        if counts["running_stale"] > 0 {
            status = "failed";
            issues.push(format!(
                "Detected {} stale running reset records older than {} minutes.",
                counts["running_stale"], running_grace_minutes
            ));
        }
        if counts["completed_missing_completed_at"] > 0 {
            status = "failed";
            issues.push(format!(
                "Detected {} completed resets missing reset_completed_at.",
                counts["completed_missing_completed_at"]
            ));
        }
        if counts["completed_missing_details"] > 0 {
            status = "failed";
            issues.push(format!(
                "Detected {} completed resets missing details.",
                counts["completed_missing_details"]
            ));
        }
        status
    };

    Ok(json!({
        "job": "preview_reset_integrity_audit",
        "status": status,
        "generated_at": generated_at.to_rfc3339(),
        "window_start": window_start.to_rfc3339(),
        "counts": counts,
        "issues": issues,
        "latest_by_slot": latest_by_slot,
    }))
}

fn latest_entry(record: &PreviewDbResetRow) -> Value {
    json!({
        "slot_id": record.slot_id,
        "run_id": record.run_id,
        "status": record.reset_status,
        "started_at": record.reset_started_at.to_rfc3339(),
        "completed_at": record.reset_completed_at.map(|ts| ts.to_rfc3339()),
        "strategy": record.strategy,
        "seed_version": record.seed_version,
        "snapshot_version": record.snapshot_version,
    })
}

#[allow(clippy::too_many_arguments)]
async fn daily_health_summary(
    pool: &sqlx::PgPool,
    settings: &Settings,
    output_dir: &str,
    runtime_health_cmd: Option<&str>,
    release_limit: i64,
    lookback_hours: i64,
    running_grace_minutes: i64,
) -> Result<(Value, bool)> {
    let generated_at = Utc::now();

    let runtime_health = match runtime_health_cmd {
        None => json!({"ok": true, "skipped": true}),
        Some(raw) => runtime_health_payload(raw).await?,
    };
    let preview_audit =
        preview_reset_integrity(pool, lookback_hours, running_grace_minutes).await?;
    let releases = release_summary(pool, release_limit).await?;
    let leases = slot_lease_summary(pool, settings).await?;

    let runtime_ok = runtime_health["ok"] == json!(true);
    let audit_ok = preview_audit["status"] != json!("failed");
    let overall = runtime_ok && audit_ok;

    let mut payload = json!({
        "job": "daily_health_summary",
        "generated_at": generated_at.to_rfc3339(),
        "overall_status": if overall { "passed" } else { "failed" },
        "runtime_health": runtime_health,
        "preview_reset_integrity": preview_audit,
        "release_summary": releases,
        "slot_lease_summary": leases,
    });

    let target_dir = Path::new(output_dir);
    std::fs::create_dir_all(target_dir)
        .with_context(|| format!("create output dir {output_dir}"))?;
    let target_file =
        target_dir.join(format!("daily-health-summary-{}.json", generated_at.format("%Y%m%d")));
    std::fs::write(&target_file, format!("{payload:#}\n"))
        .with_context(|| format!("write summary {}", target_file.display()))?;

    payload["summary_file"] = json!(target_file.to_string_lossy());
    Ok((payload, overall))
}

async fn runtime_health_payload(raw_cmd: &str) -> Result<Value> {
    let command = split_command(raw_cmd);
    let Some((program, args)) = command.split_first() else {
        return Ok(json!({"ok": false, "error": "empty_command"}));
    };
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = run_captured(program, &arg_refs, None).await?;

    let tail = |s: &str| -> Vec<String> {
        let lines: Vec<&str> = s.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(20);
        lines[start..].iter().map(|l| l.to_string()).collect()
    };

    Ok(json!({
        "command": raw_cmd,
        "exit_code": output.exit_code,
        "ok": output.success(),
        "stdout_tail": tail(&output.stdout),
        "stderr_tail": tail(&output.stderr),
    }))
}

async fn release_summary(pool: &sqlx::PgPool, release_limit: i64) -> Result<Value> {
    let mut conn = pool.acquire().await?;
    let releases = list_releases(&mut conn, None, release_limit.max(1)).await?;

    let mut status_counts: BTreeMap<String, i64> = BTreeMap::new();
    for release in &releases {
        *status_counts.entry(release.status.clone()).or_default() += 1;
    }

    let entry = |r: &ovs_db::records::ReleaseRow| {
        json!({
            "release_id": r.release_id,
            "commit_sha": r.commit_sha,
            "status": r.status,
            "deployed_at": r.deployed_at.map(|ts| ts.to_rfc3339()),
        })
    };
    let latest = releases.first().map(entry);
    let latest_deployed = releases
        .iter()
        .find(|r| r.status == "deployed" || r.status == "rolled_back")
        .map(entry);

    Ok(json!({
        "limit": release_limit.max(1),
        "count": releases.len(),
        "status_counts": status_counts,
        "latest": latest,
        "latest_deployed": latest_deployed,
    }))
}

async fn slot_lease_summary(pool: &sqlx::PgPool, settings: &Settings) -> Result<Value> {
    let leases = SlotLeaseManager::new(settings);
    let mut tx = pool.begin().await?;
    let states = leases.list_states(&mut tx).await?;
    tx.commit().await?;

    let mut state_counts: BTreeMap<String, i64> = BTreeMap::new();
    state_counts.insert("available".to_string(), 0);
    for state in &states {
        *state_counts.entry(state.state.clone()).or_default() += 1;
    }

    let rows: Vec<Value> = states
        .iter()
        .map(|s| {
            json!({
                "slot_id": s.slot_id,
                "state": s.state,
                "run_id": s.run_id,
                "expires_at": s.expires_at.map(|ts: DateTime<Utc>| ts.to_rfc3339()),
            })
        })
        .collect();

    Ok(json!({
        "configured_slots": settings.slot_ids,
        "state_counts": state_counts,
        "states": rows,
    }))
}
