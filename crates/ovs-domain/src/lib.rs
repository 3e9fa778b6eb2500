//! Core domain types for the Overseer control plane: the run state machine,
//! failure reason codes, and the error kinds shared across components.

use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{CoreError, CoreResult};

/// Lifecycle state of a run. Terminal states have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Planning,
    Editing,
    Testing,
    PreviewReady,
    NeedsApproval,
    Approved,
    Merging,
    Deploying,
    Merged,
    Failed,
    Canceled,
    Expired,
}

impl RunState {
    pub const ALL: [RunState; 13] = [
        RunState::Queued,
        RunState::Planning,
        RunState::Editing,
        RunState::Testing,
        RunState::PreviewReady,
        RunState::NeedsApproval,
        RunState::Approved,
        RunState::Merging,
        RunState::Deploying,
        RunState::Merged,
        RunState::Failed,
        RunState::Canceled,
        RunState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Planning => "planning",
            RunState::Editing => "editing",
            RunState::Testing => "testing",
            RunState::PreviewReady => "preview_ready",
            RunState::NeedsApproval => "needs_approval",
            RunState::Approved => "approved",
            RunState::Merging => "merging",
            RunState::Deploying => "deploying",
            RunState::Merged => "merged",
            RunState::Failed => "failed",
            RunState::Canceled => "canceled",
            RunState::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TransitionRuleError> {
        match s {
            "queued" => Ok(RunState::Queued),
            "planning" => Ok(RunState::Planning),
            "editing" => Ok(RunState::Editing),
            "testing" => Ok(RunState::Testing),
            "preview_ready" => Ok(RunState::PreviewReady),
            "needs_approval" => Ok(RunState::NeedsApproval),
            "approved" => Ok(RunState::Approved),
            "merging" => Ok(RunState::Merging),
            "deploying" => Ok(RunState::Deploying),
            "merged" => Ok(RunState::Merged),
            "failed" => Ok(RunState::Failed),
            "canceled" => Ok(RunState::Canceled),
            "expired" => Ok(RunState::Expired),
            other => Err(TransitionRuleError::UnknownState(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Merged | RunState::Failed | RunState::Canceled | RunState::Expired
        )
    }

    /// Targets legally reachable from this state.
    pub fn allowed_targets(&self) -> &'static [RunState] {
        use RunState::*;
        match self {
            Queued => &[Planning, Canceled, Failed, Expired],
            Planning => &[Editing, Canceled, Failed, Expired],
            Editing => &[Testing, Canceled, Failed, Expired],
            Testing => &[PreviewReady, Failed, Canceled, Expired],
            PreviewReady => &[NeedsApproval, Canceled, Failed, Expired],
            NeedsApproval => &[Approved, Failed, Canceled, Expired],
            Approved => &[Merging, Failed, Canceled, Expired],
            Merging => &[Deploying, Failed, Canceled],
            Deploying => &[Merged, Failed, Canceled],
            Merged | Failed | Canceled | Expired => &[],
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause attached to every transition into `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReasonCode {
    WaitingForSlot,
    ValidationFailed,
    ChecksFailed,
    MergeConflict,
    MigrationFailed,
    DeployPushFailed,
    DeployHealthcheckFailed,
    PreviewPublishFailed,
    AgentTimeout,
    AgentCanceled,
    PreviewExpired,
    PolicyRejected,
    UnknownError,
}

impl FailureReasonCode {
    pub const ALL: [FailureReasonCode; 13] = [
        FailureReasonCode::WaitingForSlot,
        FailureReasonCode::ValidationFailed,
        FailureReasonCode::ChecksFailed,
        FailureReasonCode::MergeConflict,
        FailureReasonCode::MigrationFailed,
        FailureReasonCode::DeployPushFailed,
        FailureReasonCode::DeployHealthcheckFailed,
        FailureReasonCode::PreviewPublishFailed,
        FailureReasonCode::AgentTimeout,
        FailureReasonCode::AgentCanceled,
        FailureReasonCode::PreviewExpired,
        FailureReasonCode::PolicyRejected,
        FailureReasonCode::UnknownError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReasonCode::WaitingForSlot => "WAITING_FOR_SLOT",
            FailureReasonCode::ValidationFailed => "VALIDATION_FAILED",
            FailureReasonCode::ChecksFailed => "CHECKS_FAILED",
            FailureReasonCode::MergeConflict => "MERGE_CONFLICT",
            FailureReasonCode::MigrationFailed => "MIGRATION_FAILED",
            FailureReasonCode::DeployPushFailed => "DEPLOY_PUSH_FAILED",
            FailureReasonCode::DeployHealthcheckFailed => "DEPLOY_HEALTHCHECK_FAILED",
            FailureReasonCode::PreviewPublishFailed => "PREVIEW_PUBLISH_FAILED",
            FailureReasonCode::AgentTimeout => "AGENT_TIMEOUT",
            FailureReasonCode::AgentCanceled => "AGENT_CANCELED",
            FailureReasonCode::PreviewExpired => "PREVIEW_EXPIRED",
            FailureReasonCode::PolicyRejected => "POLICY_REJECTED",
            FailureReasonCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TransitionRuleError> {
        FailureReasonCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| TransitionRuleError::UnknownFailureReason(s.to_string()))
    }

    /// Recoverable failures invite resumption through a child run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FailureReasonCode::AgentTimeout | FailureReasonCode::PreviewExpired
        )
    }
}

impl std::fmt::Display for FailureReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Violation of the run state machine rules.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransitionRuleError {
    #[error("cannot transition terminal state '{0}'")]
    TerminalState(RunState),
    #[error("invalid transition '{from}' -> '{to}'")]
    InvalidTransition { from: RunState, to: RunState },
    #[error("failure_reason_code is required when transitioning to failed")]
    MissingFailureReason,
    #[error("failure_reason_code is only valid for failed transitions")]
    UnexpectedFailureReason,
    #[error("invalid run status: {0}")]
    UnknownState(String),
    #[error("invalid failure reason code: {0}")]
    UnknownFailureReason(String),
}

/// Validate one edge of the state machine.
///
/// Rules: terminal states are frozen; the target must be in the source's
/// allowed set; `failed` requires a reason and every other target forbids one.
pub fn ensure_transition_allowed(
    current: RunState,
    target: RunState,
    failure_reason: Option<FailureReasonCode>,
) -> Result<(), TransitionRuleError> {
    if current.is_terminal() {
        return Err(TransitionRuleError::TerminalState(current));
    }
    if !current.allowed_targets().contains(&target) {
        return Err(TransitionRuleError::InvalidTransition {
            from: current,
            to: target,
        });
    }
    if target == RunState::Failed && failure_reason.is_none() {
        return Err(TransitionRuleError::MissingFailureReason);
    }
    if target != RunState::Failed && failure_reason.is_some() {
        return Err(TransitionRuleError::UnexpectedFailureReason);
    }
    Ok(())
}

/// Resume endpoint advertised in recoverable failure payloads.
pub fn resume_endpoint(run_id: &str) -> String {
    format!("/api/runs/{run_id}/resume")
}

/// Extend a transition payload with the recoverable-failure contract fields.
pub fn recoverable_payload_fields(
    run_id: &str,
    reason: FailureReasonCode,
) -> Vec<(&'static str, serde_json::Value)> {
    vec![
        ("failure_reason_code", serde_json::Value::from(reason.as_str())),
        ("recoverable", serde_json::Value::from(true)),
        ("recovery_strategy", serde_json::Value::from("create_child_run")),
        ("resume_endpoint", serde_json::Value::from(resume_endpoint(run_id))),
    ]
}

pub fn list_run_states() -> Vec<&'static str> {
    RunState::ALL.iter().map(RunState::as_str).collect()
}

pub fn list_failure_reason_codes() -> Vec<&'static str> {
    FailureReasonCode::ALL.iter().map(FailureReasonCode::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in RunState::ALL {
            assert_eq!(RunState::parse(state.as_str()).unwrap(), state);
        }
        assert!(RunState::parse("bogus").is_err());
    }

    #[test]
    fn failure_reason_strings_round_trip() {
        for code in FailureReasonCode::ALL {
            assert_eq!(FailureReasonCode::parse(code.as_str()).unwrap(), code);
        }
        assert!(FailureReasonCode::parse("NOPE").is_err());
    }

    #[test]
    fn terminal_states_are_frozen() {
        for state in [RunState::Merged, RunState::Failed, RunState::Canceled, RunState::Expired] {
            let err = ensure_transition_allowed(state, RunState::Queued, None).unwrap_err();
            assert_eq!(err, TransitionRuleError::TerminalState(state));
            assert!(state.allowed_targets().is_empty());
        }
    }

    #[test]
    fn failed_requires_reason_and_only_failed_takes_one() {
        let err = ensure_transition_allowed(RunState::Testing, RunState::Failed, None).unwrap_err();
        assert_eq!(err, TransitionRuleError::MissingFailureReason);

        let err = ensure_transition_allowed(
            RunState::Testing,
            RunState::PreviewReady,
            Some(FailureReasonCode::ChecksFailed),
        )
        .unwrap_err();
        assert_eq!(err, TransitionRuleError::UnexpectedFailureReason);

        ensure_transition_allowed(
            RunState::Testing,
            RunState::Failed,
            Some(FailureReasonCode::ValidationFailed),
        )
        .unwrap();
    }

    #[test]
    fn merging_and_deploying_cannot_expire() {
        for state in [RunState::Merging, RunState::Deploying] {
            let err = ensure_transition_allowed(state, RunState::Expired, None).unwrap_err();
            assert!(matches!(err, TransitionRuleError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn every_declared_edge_is_accepted() {
        for from in RunState::ALL {
            for to in from.allowed_targets() {
                let reason = (*to == RunState::Failed).then_some(FailureReasonCode::UnknownError);
                ensure_transition_allowed(from, *to, reason).unwrap();
            }
        }
    }

    #[test]
    fn recoverable_reasons() {
        assert!(FailureReasonCode::AgentTimeout.is_recoverable());
        assert!(FailureReasonCode::PreviewExpired.is_recoverable());
        assert!(!FailureReasonCode::MergeConflict.is_recoverable());

        let fields = recoverable_payload_fields("r-1", FailureReasonCode::PreviewExpired);
        let map: std::collections::BTreeMap<_, _> = fields.into_iter().collect();
        assert_eq!(map["recoverable"], serde_json::Value::from(true));
        assert_eq!(map["resume_endpoint"], serde_json::Value::from("/api/runs/r-1/resume"));
    }
}
