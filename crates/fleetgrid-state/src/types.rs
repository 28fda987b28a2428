//! Domain types shared across the FleetGrid control plane.
//!
//! Lifecycle and health enums are used by the pool, the health monitor, and
//! the API; `ScalingDecision` and `PoolCheckpoint` are the persisted records.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker instance.
pub type InstanceId = String;

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of a worker instance.
///
/// Transitions only move forward:
/// `Provisioning → Ready → Draining → Terminated`
/// (`Provisioning → Terminated` on provisioning timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Provisioning,
    Ready,
    Draining,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status as determined by consecutive probe outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No successful probe yet.
    Unknown,
    Healthy,
    /// Failing, but fewer than the unhealthy threshold in a row.
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Scaling ───────────────────────────────────────────────────────

/// Why a scaling decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Desired count exceeded the ready count.
    ScaleUp,
    /// Desired count stayed below the ready count for the full cooldown.
    ScaleDown,
    /// No ready instances while capacity is demanded.
    EmergencyScaleUp,
    /// Desired equals current.
    Steady,
    /// Desired is below current but the cooldown has not elapsed yet.
    CooldownPending,
    /// No fresh load metric; size is held.
    NoMetrics,
    /// Issued by an operator through the control surface.
    Manual,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
            Self::EmergencyScaleUp => "emergency_scale_up",
            Self::Steady => "steady",
            Self::CooldownPending => "cooldown_pending",
            Self::NoMetrics => "no_metrics",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A target instance count produced by the autoscaler or an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub target: u32,
    pub reason: ReasonCode,
    /// Unix timestamp (milliseconds). Strictly increasing per producer.
    pub decided_at: u64,
    /// Ready count observed when the decision was computed.
    pub observed_ready: u32,
    /// Unclamped-then-clamped desired count.
    pub desired: u32,
    /// Aggregate utilization the decision was based on, if any.
    pub aggregate_load: Option<f64>,
}

impl ScalingDecision {
    /// A decision issued by hand, bypassing the autoscaler.
    pub fn manual(target: u32, decided_at: u64) -> Self {
        Self {
            target,
            reason: ReasonCode::Manual,
            decided_at,
            observed_ready: 0,
            desired: target,
            aggregate_load: None,
        }
    }

    /// Whether this decision asks for a different size than `current`.
    pub fn changes(&self, current: u32) -> bool {
        self.target != current
    }

    /// Build the history key for the decision log table.
    pub fn log_key(&self) -> String {
        format!("{:020}", self.decided_at)
    }
}

/// Pool bookkeeping that must survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolCheckpoint {
    /// Last published snapshot version.
    pub snapshot_version: u64,
    /// Unix timestamp (milliseconds) of the publication.
    pub updated_at: u64,
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&ReasonCode::EmergencyScaleUp).unwrap(),
            "\"emergency_scale_up\""
        );
        assert_eq!(
            serde_json::to_string(&LifecycleState::Provisioning).unwrap(),
            "\"provisioning\""
        );
        assert_eq!(HealthStatus::Degraded.to_string(), "degraded");
    }

    #[test]
    fn log_keys_sort_chronologically() {
        let early = ScalingDecision::manual(2, 999);
        let late = ScalingDecision::manual(2, 1_000_000);
        assert!(early.log_key() < late.log_key());
    }

    #[test]
    fn epoch_millis_returns_reasonable_value() {
        // After 2024-01-01.
        assert!(epoch_millis() > 1_704_067_200_000);
    }
}
