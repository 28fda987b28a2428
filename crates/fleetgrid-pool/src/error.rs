//! Pool error types.

use std::fmt;

use thiserror::Error;

/// Why a scaling decision was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Not newer than the currently applied decision.
    Stale { decided_at: u64, applied_at: u64 },
    /// Target outside `[min_instances, max_instances]`.
    OutOfBounds { target: u32, min: u32, max: u32 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale {
                decided_at,
                applied_at,
            } => write!(
                f,
                "stale decision (decided at {decided_at}, applied decision is from {applied_at})"
            ),
            Self::OutOfBounds { target, min, max } => {
                write!(f, "target {target} outside bounds [{min}, {max}]")
            }
        }
    }
}

/// Errors raised by the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("scaling decision rejected: {0}")]
    Rejected(RejectReason),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance {0} did not become ready before the provisioning timeout")]
    ProvisioningTimeout(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("termination failed: {0}")]
    Terminate(String),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

pub type PoolResult<T> = Result<T, PoolError>;
