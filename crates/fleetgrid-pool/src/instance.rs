//! Worker instance records and their live gauges.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use fleetgrid_state::{HealthStatus, InstanceId, LifecycleState};

/// Live load and in-flight counters for one instance.
///
/// Shared by `Arc` between the pool's record and every snapshot entry for
/// the same instance, so probes and admission leases update a single value
/// without republishing the snapshot. Load has one writer (the instance's
/// probe loop); in-flight moves only through [`try_reserve`](Self::try_reserve)
/// and [`release`](Self::release).
#[derive(Debug, Default)]
pub struct InstanceGauges {
    load_bits: AtomicU64,
    in_flight: AtomicU32,
    /// Unix millis of the last probe that carried a load value; 0 = never.
    last_probe: AtomicU64,
}

impl InstanceGauges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Acquire))
    }

    /// Store a load sample taken at `at` (Unix millis).
    pub fn record_load(&self, load: f64, at: u64) {
        let load = if load.is_finite() { load.max(0.0) } else { 0.0 };
        self.load_bits.store(load.to_bits(), Ordering::Release);
        self.last_probe.store(at, Ordering::Release);
    }

    /// Timestamp of the last load sample, if any.
    pub fn last_probe(&self) -> Option<u64> {
        match self.last_probe.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Reserve one in-flight slot if the count is below `ceiling`.
    pub fn try_reserve(&self, ceiling: u32) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < ceiling).then_some(current + 1)
            })
            .is_ok()
    }

    /// Release one in-flight slot. Never underflows.
    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }
}

/// The pool's record of one worker.
#[derive(Debug, Clone)]
pub struct WorkerInstance {
    pub id: InstanceId,
    /// Assigned by the provisioner; `None` while the call is outstanding.
    pub endpoint: Option<String>,
    pub state: LifecycleState,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    pub gauges: Arc<InstanceGauges>,
    /// Unix millis.
    pub created_at: u64,
    /// Creation order; breaks `created_at` ties.
    pub(crate) seq: u64,
    /// When health last turned `Unhealthy` (Unix millis).
    pub unhealthy_since: Option<u64>,
    /// Forced termination time for a draining instance (Unix millis).
    pub drain_deadline: Option<u64>,
}

impl WorkerInstance {
    pub(crate) fn provisioning(id: InstanceId, seq: u64, now: u64) -> Self {
        Self {
            id,
            endpoint: None,
            state: LifecycleState::Provisioning,
            health: HealthStatus::Unknown,
            consecutive_failures: 0,
            gauges: Arc::new(InstanceGauges::new()),
            created_at: now,
            seq,
            unhealthy_since: None,
            drain_deadline: None,
        }
    }

    /// Whether the instance belongs in the routable snapshot.
    pub fn is_routable(&self) -> bool {
        self.state == LifecycleState::Ready
            && self.health != HealthStatus::Unhealthy
            && self.endpoint.is_some()
    }

    pub fn view(&self) -> InstanceView {
        InstanceView {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            state: self.state,
            health: self.health,
            load: self.gauges.load(),
            in_flight: self.gauges.in_flight(),
            consecutive_failures: self.consecutive_failures,
            last_probe_at: self.gauges.last_probe(),
            created_at: self.created_at,
        }
    }
}

/// Serializable view of an instance for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub id: InstanceId,
    pub endpoint: Option<String>,
    pub state: LifecycleState,
    pub health: HealthStatus,
    pub load: f64,
    pub in_flight: u32,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<u64>,
    pub created_at: u64,
}
