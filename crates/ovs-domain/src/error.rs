//! Error kinds shared across the control plane.
//!
//! Services return `CoreError` for conditions the HTTP boundary must
//! distinguish; everything else rides in the `Internal` variant. The string
//! payloads are stable machine-readable codes (`run_not_found`,
//! `slot_bound_to_other_run`, ...) surfaced verbatim in API error bodies.

use crate::TransitionRuleError;

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Entity lookup failed (run, release, slot, artifact file).
    #[error("not_found:{0}")]
    NotFound(String),

    /// The run state machine rejected the requested transition.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionRuleError),

    /// An operation precondition does not hold (terminal state, missing
    /// commit SHA, missing worktree, inactive lease).
    #[error("precondition_violated:{0}")]
    PreconditionViolated(String),

    /// A shared resource is held by someone else (branch name conflict,
    /// slot bound to a different run).
    #[error("resource_conflict:{0}")]
    ResourceConflict(String),

    /// Invalid or missing configuration (e.g. a required check without a
    /// command).
    #[error("configuration_error:{0}")]
    ConfigurationError(String),

    /// A supervised subprocess failed (non-zero exit, timeout, spawn error).
    #[error("subprocess_failure:{0}")]
    SubprocessFailure(String),

    /// Remote branch is not a strict ancestor of the local branch.
    #[error("push_not_fast_forward:{0}")]
    PushNotFastForward(String),

    /// A health probe failed after deploy or publish.
    #[error("health_check_failed:{0}")]
    HealthCheckFailed(String),

    /// Artifact content request resolved outside the configured roots.
    #[error("artifact_path_denied:{0}")]
    ArtifactPathDenied(String),

    /// Request payload failed validation.
    #[error("validation_error:{0}")]
    ValidationError(String),

    /// Anything else: database faults, I/O, bugs.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable code for logs and API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::InvalidTransition(_) => "invalid_transition",
            CoreError::PreconditionViolated(_) => "precondition_violated",
            CoreError::ResourceConflict(_) => "resource_conflict",
            CoreError::ConfigurationError(_) => "configuration_error",
            CoreError::SubprocessFailure(_) => "subprocess_failure",
            CoreError::PushNotFastForward(_) => "push_not_fast_forward",
            CoreError::HealthCheckFailed(_) => "health_check_failed",
            CoreError::ArtifactPathDenied(_) => "artifact_path_denied",
            CoreError::ValidationError(_) => "validation_error",
            CoreError::Internal(_) => "internal_error",
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Internal(anyhow::Error::new(err).context("database operation failed"))
    }
}
