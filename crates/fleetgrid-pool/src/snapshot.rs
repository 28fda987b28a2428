//! Immutable, versioned views of the routable pool.

use std::sync::Arc;

use fleetgrid_state::InstanceId;

use crate::instance::{InstanceGauges, WorkerInstance};

/// One routable instance inside a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub id: InstanceId,
    pub endpoint: String,
    /// Same gauges as the pool record.
    pub gauges: Arc<InstanceGauges>,
}

/// Instances that may receive traffic, at a given version.
///
/// Never mutated after publication. Entries are sorted by id.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub version: u64,
    /// Unix millis.
    pub published_at: u64,
    pub entries: Vec<SnapshotEntry>,
}

impl PoolSnapshot {
    pub(crate) fn build<'a>(
        version: u64,
        published_at: u64,
        instances: impl Iterator<Item = &'a WorkerInstance>,
    ) -> Self {
        let mut entries: Vec<SnapshotEntry> = instances
            .filter(|inst| inst.is_routable())
            .filter_map(|inst| {
                Some(SnapshotEntry {
                    id: inst.id.clone(),
                    endpoint: inst.endpoint.clone()?,
                    gauges: Arc::clone(&inst.gauges),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            version,
            published_at,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SnapshotEntry> {
        self.entries
            .binary_search_by(|e| e.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn member_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.id.as_str()).collect()
    }

    /// Mean load over entries sampled within `max_age_ms` of `now`.
    ///
    /// `None` when no entry has a fresh sample.
    pub fn aggregate_load(&self, now: u64, max_age_ms: u64) -> Option<f64> {
        let fresh: Vec<f64> = self
            .entries
            .iter()
            .filter(|e| {
                e.gauges
                    .last_probe()
                    .is_some_and(|at| now.saturating_sub(at) <= max_age_ms)
            })
            .map(|e| e.gauges.load())
            .collect();
        if fresh.is_empty() {
            None
        } else {
            Some(fresh.iter().sum::<f64>() / fresh.len() as f64)
        }
    }

    /// Total in-flight requests across the snapshot.
    pub fn in_flight(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| u64::from(e.gauges.in_flight()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{HealthStatus, LifecycleState};

    fn ready(id: &str, seq: u64) -> WorkerInstance {
        let mut inst = WorkerInstance::provisioning(id.to_string(), seq, 1_000);
        inst.endpoint = Some(format!("10.0.0.{seq}:8080"));
        inst.state = LifecycleState::Ready;
        inst.health = HealthStatus::Healthy;
        inst
    }

    #[test]
    fn build_keeps_only_routable_sorted() {
        let mut unhealthy = ready("w-2", 2);
        unhealthy.health = HealthStatus::Unhealthy;
        let provisioning = WorkerInstance::provisioning("w-0".into(), 4, 1_000);
        let instances = [ready("w-3", 3), unhealthy, ready("w-1", 1), provisioning];

        let snap = PoolSnapshot::build(7, 5_000, instances.iter());
        assert_eq!(snap.version, 7);
        assert_eq!(snap.member_ids(), vec!["w-1", "w-3"]);
        assert!(snap.contains("w-3"));
        assert!(!snap.contains("w-2"));
    }

    #[test]
    fn entries_share_gauges_with_records() {
        let inst = ready("w-1", 1);
        let snap = PoolSnapshot::build(1, 0, std::iter::once(&inst));
        inst.gauges.record_load(0.9, 10);
        assert_eq!(snap.get("w-1").unwrap().gauges.load(), 0.9);
    }

    #[test]
    fn aggregate_load_ignores_stale_samples() {
        let a = ready("w-1", 1);
        let b = ready("w-2", 2);
        let c = ready("w-3", 3);
        a.gauges.record_load(0.8, 10_000);
        b.gauges.record_load(0.4, 9_000);
        c.gauges.record_load(5.0, 1_000);
        let snap = PoolSnapshot::build(1, 0, [a, b, c].iter());

        let load = snap.aggregate_load(10_000, 2_000).unwrap();
        assert!((load - 0.6).abs() < 1e-9);
        assert_eq!(snap.aggregate_load(100_000, 2_000), None);
    }

    #[test]
    fn empty_snapshot_has_no_load() {
        let snap = PoolSnapshot::default();
        assert!(snap.is_empty());
        assert_eq!(snap.aggregate_load(0, 1_000), None);
        assert_eq!(snap.in_flight(), 0);
    }
}
