//! Slot lease manager.
//!
//! A slot lease is the time-bounded exclusive right for a run to occupy one
//! of the configured preview slots, maintained by TTL plus heartbeat. All
//! operations run on the caller's connection: the worker folds `acquire` into
//! its claim transaction, the HTTP layer wraps each call in its own.
//!
//! Exceptional conditions (lease expired, nothing free) are distinguished
//! return variants, not errors.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::PgConnection;
use tracing::warn;

use ovs_config::Settings;
use ovs_db::events::{append_run_event, NewRunEvent};
use ovs_db::leases::{self, LeaseRow};
use ovs_db::runs;
use ovs_domain::{
    ensure_transition_allowed, recoverable_payload_fields, CoreError, CoreResult,
    FailureReasonCode, RunState,
};

pub const WAITING_FOR_SLOT_REASON: &str = "WAITING_FOR_SLOT";

/// Outcome of an acquire attempt. `acquired=false` with a `queue_reason`
/// means the run stays queued; nothing was mutated besides the wait event.
#[derive(Debug, Clone, Serialize)]
pub struct AcquireOutcome {
    pub acquired: bool,
    pub slot_id: Option<String>,
    pub queue_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub released: bool,
    pub slot_id: String,
    pub run_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatOutcome {
    pub heartbeat_updated: bool,
    pub slot_id: String,
    pub run_id: String,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReapOutcome {
    pub expired_count: i64,
    pub expired_slots: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotState {
    pub slot_id: String,
    pub state: String,
    pub run_id: Option<String>,
    pub lease_state: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// Lease operations over the configured slot set.
#[derive(Debug, Clone)]
pub struct SlotLeaseManager {
    slot_ids: Vec<String>,
    ttl_seconds: i64,
}

impl SlotLeaseManager {
    pub fn new(settings: &Settings) -> Self {
        SlotLeaseManager {
            slot_ids: settings.slot_ids.clone(),
            ttl_seconds: settings.slot_lease_ttl_seconds.max(30),
        }
    }

    pub fn from_parts(slot_ids: Vec<String>, ttl_seconds: i64) -> Self {
        SlotLeaseManager {
            slot_ids,
            ttl_seconds: ttl_seconds.max(1),
        }
    }

    pub fn slot_ids(&self) -> &[String] {
        &self.slot_ids
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    fn is_configured(&self, slot_id: &str) -> bool {
        self.slot_ids.iter().any(|s| s == slot_id)
    }

    /// Acquire a lease for `run_id`.
    ///
    /// Under one lock over every configured slot row: reap anything already
    /// past its deadline, return the existing lease if the run still holds
    /// one (idempotent), otherwise hand out the first configured slot with no
    /// live lease. Slot order is configured list order, not run age.
    pub async fn acquire(
        &self,
        conn: &mut PgConnection,
        run_id: &str,
    ) -> CoreResult<AcquireOutcome> {
        runs::fetch_run(conn, run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("run_not_found"))?;

        let now = Utc::now();
        let expiry = now + Duration::seconds(self.ttl_seconds);
        let held = leases::lock_leases(conn, &self.slot_ids).await?;

        for lease in &held {
            if lease.lease_state == leases::LEASED && lease.expires_at <= now {
                self.expire_lease_and_link_run(conn, lease, now, "slot_acquire_ttl_reaper")
                    .await?;
            }
        }

        // Idempotent acquire when the run already holds a live lease.
        if let Some(existing) = held.iter().find(|l| l.run_id == run_id && l.is_live(now)) {
            runs::set_run_slot(conn, run_id, Some(&existing.slot_id)).await?;
            append_run_event(
                conn,
                NewRunEvent::new(run_id, "slot_acquire_idempotent").with_payload(json!({
                    "slot_id": existing.slot_id,
                    "expires_at": existing.expires_at.to_rfc3339(),
                })),
            )
            .await?;
            return Ok(AcquireOutcome {
                acquired: true,
                slot_id: Some(existing.slot_id.clone()),
                queue_reason: None,
                expires_at: Some(existing.expires_at),
                ttl_seconds: self.ttl_seconds,
            });
        }

        let occupied: Vec<&str> = held
            .iter()
            .filter(|l| l.is_live(now))
            .map(|l| l.slot_id.as_str())
            .collect();

        let selected = self
            .slot_ids
            .iter()
            .find(|slot_id| !occupied.contains(&slot_id.as_str()));

        let Some(selected) = selected else {
            let mut occupied_sorted: Vec<&str> = occupied.clone();
            occupied_sorted.sort_unstable();
            append_run_event(
                conn,
                NewRunEvent::new(run_id, "slot_waiting").with_payload(json!({
                    "reason": WAITING_FOR_SLOT_REASON,
                    "occupied_slots": occupied_sorted,
                    "queue_behavior": "run_kept_queued_while_waiting_for_slot",
                })),
            )
            .await?;
            return Ok(AcquireOutcome {
                acquired: false,
                slot_id: None,
                queue_reason: Some(WAITING_FOR_SLOT_REASON.to_string()),
                expires_at: None,
                ttl_seconds: self.ttl_seconds,
            });
        };

        leases::upsert_lease(conn, selected, run_id, now, expiry).await?;
        runs::set_run_slot(conn, run_id, Some(selected)).await?;
        append_run_event(
            conn,
            NewRunEvent::new(run_id, "slot_acquired").with_payload(json!({
                "slot_id": selected,
                "expires_at": expiry.to_rfc3339(),
                "ttl_seconds": self.ttl_seconds,
            })),
        )
        .await?;

        Ok(AcquireOutcome {
            acquired: true,
            slot_id: Some(selected.clone()),
            queue_reason: None,
            expires_at: Some(expiry),
            ttl_seconds: self.ttl_seconds,
        })
    }

    /// Release a lease. A mismatched `run_id` is refused with a reason, not
    /// an error, so callers can log and move on.
    pub async fn release(
        &self,
        conn: &mut PgConnection,
        slot_id: &str,
        run_id: Option<&str>,
    ) -> CoreResult<ReleaseOutcome> {
        let Some(lease) = leases::fetch_lease_for_update(conn, slot_id).await? else {
            return Ok(ReleaseOutcome {
                released: false,
                slot_id: slot_id.to_string(),
                run_id: run_id.map(str::to_string),
                reason: Some("slot_not_found".to_string()),
            });
        };

        if let Some(run_id) = run_id {
            if lease.run_id != run_id {
                return Ok(ReleaseOutcome {
                    released: false,
                    slot_id: slot_id.to_string(),
                    run_id: Some(run_id.to_string()),
                    reason: Some("slot_owned_by_different_run".to_string()),
                });
            }
        }

        let now = Utc::now();
        let owning_run_id = lease.run_id.clone();
        leases::set_lease_state(conn, slot_id, leases::RELEASED, Some(now), now).await?;

        if let Some(run) = runs::fetch_run(conn, &owning_run_id).await? {
            if run.slot_id.as_deref() == Some(slot_id) {
                runs::set_run_slot(conn, &owning_run_id, None).await?;
            }
        }

        append_run_event(
            conn,
            NewRunEvent::new(&owning_run_id, "slot_released")
                .with_payload(json!({ "slot_id": slot_id })),
        )
        .await?;

        Ok(ReleaseOutcome {
            released: true,
            slot_id: slot_id.to_string(),
            run_id: Some(owning_run_id),
            reason: None,
        })
    }

    /// Re-arm the lease deadline iff the lease is still live. A lease past
    /// its deadline triggers the same expiry finalization as the reaper; a
    /// deliberately released lease is only rejected, never rewritten to
    /// expired.
    pub async fn heartbeat(
        &self,
        conn: &mut PgConnection,
        slot_id: &str,
        run_id: &str,
    ) -> CoreResult<HeartbeatOutcome> {
        let lease = leases::fetch_lease_for_update(conn, slot_id)
            .await?
            .filter(|l| l.run_id == run_id);

        let Some(lease) = lease else {
            return Ok(HeartbeatOutcome {
                heartbeat_updated: false,
                slot_id: slot_id.to_string(),
                run_id: run_id.to_string(),
                reason: Some("lease_not_found".to_string()),
                expires_at: None,
            });
        };

        if lease.lease_state == leases::RELEASED {
            append_run_event(
                conn,
                NewRunEvent::new(run_id, "slot_heartbeat_rejected")
                    .with_payload(json!({ "slot_id": slot_id, "reason": "lease_released" })),
            )
            .await?;
            return Ok(HeartbeatOutcome {
                heartbeat_updated: false,
                slot_id: slot_id.to_string(),
                run_id: run_id.to_string(),
                reason: Some("lease_released".to_string()),
                expires_at: None,
            });
        }

        let now = Utc::now();
        if !lease.is_live(now) {
            self.expire_lease_and_link_run(conn, &lease, now, "slot_heartbeat")
                .await?;
            append_run_event(
                conn,
                NewRunEvent::new(run_id, "slot_heartbeat_rejected")
                    .with_payload(json!({ "slot_id": slot_id, "reason": "lease_expired" })),
            )
            .await?;
            return Ok(HeartbeatOutcome {
                heartbeat_updated: false,
                slot_id: slot_id.to_string(),
                run_id: run_id.to_string(),
                reason: Some("lease_expired".to_string()),
                expires_at: None,
            });
        }

        let new_expiry = now + Duration::seconds(self.ttl_seconds);
        leases::set_lease_state(conn, slot_id, leases::LEASED, Some(new_expiry), now).await?;
        append_run_event(
            conn,
            NewRunEvent::new(run_id, "slot_heartbeat").with_payload(json!({
                "slot_id": slot_id,
                "expires_at": new_expiry.to_rfc3339(),
                "ttl_seconds": self.ttl_seconds,
            })),
        )
        .await?;

        Ok(HeartbeatOutcome {
            heartbeat_updated: true,
            slot_id: slot_id.to_string(),
            run_id: run_id.to_string(),
            reason: None,
            expires_at: Some(new_expiry),
        })
    }

    /// Reap every lease past its deadline without handing out slots.
    pub async fn reap_expired(&self, conn: &mut PgConnection) -> CoreResult<ReapOutcome> {
        let now = Utc::now();
        let held = leases::lock_leased(conn).await?;

        let mut expired_slots = Vec::new();
        for lease in &held {
            if lease.expires_at > now {
                continue;
            }
            self.expire_lease_and_link_run(conn, lease, now, "slot_reaper")
                .await?;
            expired_slots.push(lease.slot_id.clone());
        }

        expired_slots.sort_unstable();
        Ok(ReapOutcome {
            expired_count: expired_slots.len() as i64,
            expired_slots,
        })
    }

    /// One row per configured slot, with the effective state at `now`.
    pub async fn list_states(&self, conn: &mut PgConnection) -> CoreResult<Vec<SlotState>> {
        let now = Utc::now();
        let held = leases::lock_leases(conn, &self.slot_ids).await?;

        let mut states = Vec::with_capacity(self.slot_ids.len());
        for slot_id in &self.slot_ids {
            let Some(lease) = held.iter().find(|l| &l.slot_id == slot_id) else {
                states.push(SlotState {
                    slot_id: slot_id.clone(),
                    state: "available".to_string(),
                    run_id: None,
                    lease_state: None,
                    expires_at: None,
                    heartbeat_at: None,
                });
                continue;
            };

            let effective = if lease.lease_state == leases::LEASED && lease.expires_at <= now {
                leases::EXPIRED
            } else {
                lease.lease_state.as_str()
            };
            states.push(SlotState {
                slot_id: slot_id.clone(),
                state: effective.to_string(),
                run_id: Some(lease.run_id.clone()),
                lease_state: Some(lease.lease_state.clone()),
                expires_at: Some(lease.expires_at),
                heartbeat_at: Some(lease.heartbeat_at),
            });
        }
        Ok(states)
    }

    /// Validate that `run_id` holds a live lease on `slot_id`.
    pub async fn ensure_active_lease(
        &self,
        conn: &mut PgConnection,
        slot_id: &str,
        run_id: &str,
    ) -> CoreResult<LeaseRow> {
        if !self.is_configured(slot_id) {
            return Err(CoreError::ValidationError("invalid_slot_id".to_string()));
        }
        let lease = leases::fetch_lease(conn, slot_id)
            .await?
            .ok_or_else(|| CoreError::PreconditionViolated("active_lease_required".to_string()))?;
        if lease.run_id != run_id {
            return Err(CoreError::ResourceConflict("slot_bound_to_other_run".to_string()));
        }
        if !lease.is_live(Utc::now()) {
            return Err(CoreError::PreconditionViolated("active_lease_required".to_string()));
        }
        Ok(lease)
    }

    /// Move a dead lease to `expired`, unlink the owning run's slot column,
    /// and transition the run to `expired` with the recoverable contract when
    /// the state machine allows it. Illegal transitions are logged and
    /// skipped, never forced; the lease still expires either way.
    async fn expire_lease_and_link_run(
        &self,
        conn: &mut PgConnection,
        lease: &LeaseRow,
        now: DateTime<Utc>,
        source: &str,
    ) -> CoreResult<()> {
        leases::set_lease_state(conn, &lease.slot_id, leases::EXPIRED, None, now).await?;

        if let Some(run) = runs::fetch_run(conn, &lease.run_id).await? {
            if run.slot_id.as_deref() == Some(lease.slot_id.as_str()) {
                runs::set_run_slot(conn, &run.id, None).await?;
                self.mark_run_expired_for_slot_ttl(conn, &run, &lease.slot_id, source)
                    .await?;
            }
        }

        append_run_event(
            conn,
            NewRunEvent::new(&lease.run_id, "slot_expired").with_payload(json!({
                "slot_id": lease.slot_id,
                "reason": FailureReasonCode::PreviewExpired.as_str(),
                "source": source,
            })),
        )
        .await?;
        Ok(())
    }

    async fn mark_run_expired_for_slot_ttl(
        &self,
        conn: &mut PgConnection,
        run: &ovs_db::RunRow,
        slot_id: &str,
        source: &str,
    ) -> CoreResult<()> {
        let current = match RunState::parse(&run.status) {
            Ok(state) => state,
            Err(_) => {
                append_run_event(
                    conn,
                    NewRunEvent::new(&run.id, "slot_expiry_transition_skipped").with_payload(
                        json!({
                            "slot_id": slot_id,
                            "source": source,
                            "run_status": run.status,
                            "reason": "unknown_run_status",
                        }),
                    ),
                )
                .await?;
                return Ok(());
            }
        };
        if current == RunState::Expired {
            return Ok(());
        }

        if ensure_transition_allowed(current, RunState::Expired, None).is_err() {
            warn!(run_id = %run.id, slot_id, status = %run.status, "slot expiry transition skipped");
            append_run_event(
                conn,
                NewRunEvent::new(&run.id, "slot_expiry_transition_skipped").with_payload(json!({
                    "slot_id": slot_id,
                    "source": source,
                    "run_status": run.status,
                    "reason": "invalid_transition",
                })),
            )
            .await?;
            return Ok(());
        }

        runs::update_run_status(conn, &run.id, RunState::Expired).await?;

        let mut payload = serde_json::Map::new();
        payload.insert("source".into(), json!(source));
        payload.insert("reason".into(), json!(FailureReasonCode::PreviewExpired.as_str()));
        payload.insert("slot_id".into(), json!(slot_id));
        for (key, value) in recoverable_payload_fields(&run.id, FailureReasonCode::PreviewExpired) {
            payload.insert(key.to_string(), value);
        }

        append_run_event(
            conn,
            NewRunEvent::new(&run.id, "status_transition")
                .with_transition(current.as_str(), RunState::Expired.as_str())
                .with_payload(serde_json::Value::Object(payload)),
        )
        .await?;
        Ok(())
    }
}

/// Static acquire-behavior contract served by `GET /api/slots/contract`.
pub fn slot_contract(slot_ids: &[String]) -> serde_json::Value {
    json!({
        "acquire_behavior": {
            "all_slots_occupied": {
                "acquired": false,
                "queue_reason": WAITING_FOR_SLOT_REASON,
                "queue_behavior": "run_kept_queued_while_waiting_for_slot",
            }
        },
        "slot_ids": slot_ids,
    })
}
