//! Shared state for all HTTP handlers.

use std::sync::Arc;

use sqlx::PgPool;

use ovs_config::Settings;
use ovs_gate::MergeGate;
use ovs_slots::SlotLeaseManager;
use ovs_worktree::WorktreeManager;

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub settings: Arc<Settings>,
    pub leases: Arc<SlotLeaseManager>,
    pub worktrees: Arc<WorktreeManager>,
    pub gate: Arc<MergeGate>,
}

impl AppState {
    pub fn new(pool: PgPool, settings: Settings) -> Self {
        AppState {
            leases: Arc::new(SlotLeaseManager::new(&settings)),
            worktrees: Arc::new(WorktreeManager::new(&settings)),
            gate: Arc::new(MergeGate::new(&settings)),
            settings: Arc::new(settings),
            pool,
        }
    }
}
