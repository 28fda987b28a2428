use std::fmt;

use thiserror::Error;

/// Why a request could not be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityReason {
    /// The current snapshot has no routable instance.
    NoReadyInstances,
    /// Every routable instance is at its in-flight ceiling.
    AllAtCeiling,
    /// The wait queue is already at its depth.
    QueueFull,
    /// Waited `queue_timeout` without a slot opening.
    QueueTimeout,
}

impl CapacityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoReadyInstances => "no_ready_instances",
            Self::AllAtCeiling => "all_at_ceiling",
            Self::QueueFull => "queue_full",
            Self::QueueTimeout => "queue_timeout",
        }
    }
}

impl fmt::Display for CapacityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(CapacityReason),

    #[error("affinity store error: {0}")]
    Affinity(String),
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;
