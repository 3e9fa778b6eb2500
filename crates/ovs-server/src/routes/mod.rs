//! Router assembly.
//!
//! Middleware layers (CORS, tracing) are not applied here; `main.rs` attaches
//! them after this call so tests can drive the bare router.

mod approvals;
mod artifacts;
mod events;
mod misc;
mod runs;
mod slots;
mod worktrees;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the complete application router wired to the given shared state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(misc::health))
        // Runs
        .route("/api/runs", post(runs::create_run).get(runs::list_runs))
        .route("/api/runs/contract", get(runs::run_contract))
        .route("/api/runs/:run_id", get(runs::get_run))
        .route("/api/runs/:run_id/transition", post(runs::transition_run))
        .route("/api/runs/:run_id/cancel", post(runs::cancel_run))
        .route("/api/runs/:run_id/expire", post(runs::expire_run))
        .route("/api/runs/:run_id/retry", post(runs::retry_run))
        .route("/api/runs/:run_id/resume", post(runs::resume_run))
        // Events
        .route("/api/events/schema", get(events::events_schema))
        .route("/api/runs/:run_id/events", get(events::list_run_events))
        .route("/api/runs/:run_id/events/stream", get(events::stream_run_events))
        // Checks + artifacts
        .route("/api/runs/:run_id/checks", get(misc::list_run_checks))
        .route("/api/runs/:run_id/artifacts", get(artifacts::list_run_artifacts))
        .route(
            "/api/runs/:run_id/artifacts/content",
            get(artifacts::get_artifact_content),
        )
        // Approvals
        .route("/api/runs/:run_id/approvals", get(approvals::list_run_approvals))
        .route("/api/runs/:run_id/approve", post(approvals::approve_run))
        .route("/api/runs/:run_id/reject", post(approvals::reject_run))
        // Slots
        .route("/api/slots", get(slots::get_slots))
        .route("/api/slots/acquire", post(slots::acquire_slot))
        .route("/api/slots/contract", get(slots::slot_contract))
        .route("/api/slots/reap-expired", post(slots::reap_expired))
        .route("/api/slots/:slot_id/release", post(slots::release_slot))
        .route("/api/slots/:slot_id/heartbeat", post(slots::heartbeat_slot))
        // Worktrees
        .route("/api/worktrees", get(worktrees::get_worktree_bindings))
        .route("/api/worktrees/assign", post(worktrees::assign_worktree))
        .route("/api/worktrees/contract", get(worktrees::worktree_contract))
        .route(
            "/api/worktrees/:slot_id/cleanup",
            post(worktrees::cleanup_worktree),
        )
        // Metrics + releases
        .route("/api/metrics/core", get(misc::core_metrics))
        .route("/api/releases", get(misc::list_releases))
        .route("/api/releases/:release_id", get(misc::get_release))
        .with_state(state)
}
