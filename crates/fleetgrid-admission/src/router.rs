//! AdmissionRouter: picks a worker for each request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use fleet_core::AdmissionSettings;
use fleetgrid_pool::{InstanceGauges, PoolSnapshot, SnapshotEntry, WorkerPool};
use fleetgrid_state::InstanceId;

use crate::affinity::AffinityStore;
use crate::error::{AdmissionError, AdmissionResult, CapacityReason};

/// Supplies the routable snapshot, read once per admission attempt.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Arc<PoolSnapshot>;
}

impl SnapshotSource for WorkerPool {
    fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.current_snapshot()
    }
}

impl SnapshotSource for ArcSwap<PoolSnapshot> {
    fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.load_full()
    }
}

/// Admission outcome counters.
#[derive(Debug, Default)]
pub struct AdmissionCounters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    affinity_hits: AtomicU64,
    queued: AtomicU64,
}

/// Point-in-time copy of [`AdmissionCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub admitted: u64,
    pub rejected: u64,
    pub affinity_hits: u64,
    pub queued: u64,
}

impl AdmissionCounters {
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            affinity_hits: self.affinity_hits.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}

/// One reserved in-flight slot. Dropping it frees the slot and wakes
/// queued requests.
#[derive(Debug)]
pub struct Lease {
    gauges: Arc<InstanceGauges>,
    released: Arc<Notify>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.gauges.release();
        self.released.notify_waiters();
    }
}

/// A request placed on an instance.
#[derive(Debug)]
pub struct Admitted {
    pub instance_id: InstanceId,
    pub endpoint: String,
    pub snapshot_version: u64,
    pub affinity_hit: bool,
    pub lease: Lease,
}

pub struct AdmissionRouter {
    settings: AdmissionSettings,
    source: Arc<dyn SnapshotSource>,
    affinity: Option<Arc<dyn AffinityStore>>,
    queue: Semaphore,
    released: Arc<Notify>,
    counters: Arc<AdmissionCounters>,
}

impl AdmissionRouter {
    pub fn new(settings: AdmissionSettings, source: Arc<dyn SnapshotSource>) -> Self {
        let depth = settings.queue_depth as usize;
        Self {
            settings,
            source,
            affinity: None,
            queue: Semaphore::new(depth),
            released: Arc::new(Notify::new()),
            counters: Arc::new(AdmissionCounters::default()),
        }
    }

    pub fn with_affinity(mut self, store: Arc<dyn AffinityStore>) -> Self {
        self.affinity = Some(store);
        self
    }

    pub fn counters(&self) -> Arc<AdmissionCounters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> AdmissionStats {
        self.counters.stats()
    }

    /// Admit one request, optionally pinned by `session`.
    ///
    /// Waits at most `queue_timeout`, and only when a queue slot is free.
    pub async fn route(&self, session: Option<&str>) -> AdmissionResult<Admitted> {
        let pinned = match session {
            Some(session) => self.lookup_affinity(session).await,
            None => None,
        };

        let snapshot = self.source.snapshot();
        if snapshot.is_empty() {
            return Err(self.reject(CapacityReason::NoReadyInstances));
        }
        if let Some(admitted) = self.try_admit(&snapshot, pinned.as_deref()) {
            return Ok(self.admitted(admitted, session, pinned.as_deref()).await);
        }

        if self.settings.queue_depth == 0 {
            return Err(self.reject(CapacityReason::AllAtCeiling));
        }
        let Ok(_permit) = self.queue.try_acquire() else {
            return Err(self.reject(CapacityReason::QueueFull));
        };
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        debug!("request queued for capacity");

        let deadline = Instant::now() + self.settings.queue_timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-read: membership may have changed while waiting.
            let snapshot = self.source.snapshot();
            if let Some(admitted) = self.try_admit(&snapshot, pinned.as_deref()) {
                return Ok(self.admitted(admitted, session, pinned.as_deref()).await);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(self.reject(CapacityReason::QueueTimeout));
            }
        }
    }

    /// Reserve a slot on the pinned instance if it is still routable and
    /// under the ceiling, otherwise on the best-scoring instance.
    fn try_admit(&self, snapshot: &PoolSnapshot, pinned: Option<&str>) -> Option<Admitted> {
        let ceiling = self.settings.per_instance_in_flight_ceiling;

        if let Some(entry) = pinned.and_then(|id| snapshot.get(id))
            && entry.gauges.try_reserve(ceiling)
        {
            return Some(self.lease(snapshot, entry, true));
        }

        let mut candidates: Vec<(f64, &SnapshotEntry)> = snapshot
            .entries
            .iter()
            .filter(|e| e.gauges.in_flight() < ceiling)
            .map(|e| (score(&e.gauges), e))
            .collect();
        candidates.sort_by(|(a, ea), (b, eb)| a.total_cmp(b).then_with(|| ea.id.cmp(&eb.id)));

        // A losing CAS means another request took the last slot; try the next.
        candidates
            .into_iter()
            .find(|(_, entry)| entry.gauges.try_reserve(ceiling))
            .map(|(_, entry)| self.lease(snapshot, entry, false))
    }

    fn lease(&self, snapshot: &PoolSnapshot, entry: &SnapshotEntry, affinity_hit: bool) -> Admitted {
        Admitted {
            instance_id: entry.id.clone(),
            endpoint: entry.endpoint.clone(),
            snapshot_version: snapshot.version,
            affinity_hit,
            lease: Lease {
                gauges: Arc::clone(&entry.gauges),
                released: Arc::clone(&self.released),
            },
        }
    }

    async fn admitted(&self, admitted: Admitted, session: Option<&str>, pinned: Option<&str>) -> Admitted {
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        if admitted.affinity_hit {
            self.counters.affinity_hits.fetch_add(1, Ordering::Relaxed);
        } else if let Some(session) = session
            && pinned != Some(admitted.instance_id.as_str())
        {
            self.record_affinity(session, &admitted.instance_id).await;
        }
        debug!(
            instance_id = %admitted.instance_id,
            version = admitted.snapshot_version,
            affinity = admitted.affinity_hit,
            "request admitted"
        );
        admitted
    }

    fn reject(&self, reason: CapacityReason) -> AdmissionError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(%reason, "request rejected");
        AdmissionError::CapacityExhausted(reason)
    }

    async fn lookup_affinity(&self, session: &str) -> Option<InstanceId> {
        let store = self.affinity.as_ref()?;
        match store.lookup(session).await {
            Ok(found) => found,
            Err(e) => {
                warn!(session, error = %e, "affinity lookup failed; routing without it");
                None
            }
        }
    }

    async fn record_affinity(&self, session: &str, instance: &str) {
        let Some(store) = &self.affinity else {
            return;
        };
        if let Err(e) = store.record(session, instance).await {
            warn!(session, instance_id = instance, error = %e, "failed to record affinity");
        }
    }
}

/// Weighted least-connections score; lower is better.
fn score(gauges: &InstanceGauges) -> f64 {
    (f64::from(gauges.in_flight()) + 1.0) * (1.0 + gauges.load())
}
