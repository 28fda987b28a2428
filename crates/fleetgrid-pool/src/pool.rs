//! WorkerPool: owns instance lifecycle and publishes routable snapshots.
//!
//! The pool:
//! - Applies scaling decisions (provision up, drain down) in arrival order
//! - Promotes instances to `Ready` on their first successful probe
//! - Publishes a new snapshot version on every membership change
//! - Completes drains, times out stuck provisioning, and replaces
//!   long-unhealthy instances on a maintenance tick

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_core::PoolSettings;
use fleetgrid_health::{HealthMonitor, HealthReport, HealthReporter, ProbeTarget};
use fleetgrid_state::*;

use crate::error::{PoolError, PoolResult, RejectReason};
use crate::instance::{InstanceView, WorkerInstance};
use crate::provisioner::Provisioner;
use crate::snapshot::PoolSnapshot;

/// Result of applying a scaling decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScaleOutcome {
    pub target: u32,
    pub provisioned: Vec<InstanceId>,
    /// Provisioning instances dropped because the target shrank.
    pub cancelled: Vec<InstanceId>,
    pub draining: Vec<InstanceId>,
    /// Provisioning calls that failed.
    pub failed: u32,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub terminated: Vec<InstanceId>,
    pub timed_out: Vec<InstanceId>,
    pub replaced_unhealthy: Vec<InstanceId>,
    pub provisioned: Vec<InstanceId>,
    pub provision_failures: u32,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty()
            && self.timed_out.is_empty()
            && self.replaced_unhealthy.is_empty()
            && self.provisioned.is_empty()
            && self.provision_failures == 0
    }
}

/// Serializable pool overview.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub snapshot_version: u64,
    pub target: u32,
    pub ready: u32,
    pub provisioning: u32,
    pub draining: u32,
    pub last_decision: Option<ScalingDecision>,
    pub instances: Vec<InstanceView>,
}

struct PoolInner {
    instances: BTreeMap<InstanceId, WorkerInstance>,
    applied: Option<ScalingDecision>,
    target: u32,
    version: u64,
    next_seq: u64,
    /// Consecutive provisioning failures since the last success or decision.
    provision_failures: u32,
}

impl PoolInner {
    /// (ready, provisioning)
    fn active_counts(&self) -> (u32, u32) {
        self.instances
            .values()
            .fold((0, 0), |(ready, prov), inst| match inst.state {
                LifecycleState::Ready => (ready + 1, prov),
                LifecycleState::Provisioning => (ready, prov + 1),
                _ => (ready, prov),
            })
    }

    fn count(&self, state: LifecycleState) -> u32 {
        self.instances.values().filter(|i| i.state == state).count() as u32
    }
}

/// The worker pool.
pub struct WorkerPool {
    settings: PoolSettings,
    provisioner: Arc<dyn Provisioner>,
    state: StateStore,
    inner: Mutex<PoolInner>,
    snapshot: ArcSwap<PoolSnapshot>,
    /// Serializes decision application and maintenance passes.
    ops: tokio::sync::Mutex<()>,
}

impl WorkerPool {
    /// Create a pool, resuming snapshot versioning and the applied target
    /// from `state`.
    ///
    /// An empty snapshot is published immediately at one above the persisted
    /// version. Instances are provisioned by the first maintenance pass.
    pub fn new(
        settings: PoolSettings,
        provisioner: Arc<dyn Provisioner>,
        state: StateStore,
    ) -> PoolResult<Self> {
        let persisted = state
            .get_checkpoint()?
            .map(|cp| cp.snapshot_version)
            .unwrap_or(0);
        let applied = state.last_applied_decision()?;
        let target = applied
            .as_ref()
            .map(|d| d.target.clamp(settings.min_instances, settings.max_instances))
            .unwrap_or(settings.min_instances);

        let now = epoch_millis();
        let version = persisted + 1;
        let snapshot = PoolSnapshot {
            version,
            published_at: now,
            entries: Vec::new(),
        };
        state.put_checkpoint(&PoolCheckpoint {
            snapshot_version: version,
            updated_at: now,
        })?;

        info!(version, target, resumed = applied.is_some(), "worker pool initialized");

        Ok(Self {
            settings,
            provisioner,
            state,
            inner: Mutex::new(PoolInner {
                instances: BTreeMap::new(),
                applied,
                target,
                version,
                next_seq: 0,
                provision_failures: 0,
            }),
            snapshot: ArcSwap::from_pointee(snapshot),
            ops: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latest published snapshot. Never blocks.
    pub fn current_snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    pub fn target(&self) -> u32 {
        self.lock().target
    }

    pub fn applied_decision(&self) -> Option<ScalingDecision> {
        self.lock().applied.clone()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    // ── Scaling ────────────────────────────────────────────────────

    /// Apply a scaling decision.
    ///
    /// Rejected when it is not newer than the applied decision or its target
    /// is outside the configured bounds. Scale-up counts instances already
    /// provisioning toward the target. Scale-down cancels surplus
    /// provisioning instances first, then drains Ready ones.
    pub async fn apply_scaling_decision(
        &self,
        decision: ScalingDecision,
    ) -> PoolResult<ScaleOutcome> {
        let _ops = self.ops.lock().await;
        let now = epoch_millis();

        let (to_provision, cancelled, draining) = {
            let mut inner = self.lock();
            if let Some(applied) = &inner.applied
                && decision.decided_at <= applied.decided_at
            {
                return Err(PoolError::Rejected(RejectReason::Stale {
                    decided_at: decision.decided_at,
                    applied_at: applied.decided_at,
                }));
            }
            let (min, max) = (self.settings.min_instances, self.settings.max_instances);
            if decision.target < min || decision.target > max {
                return Err(PoolError::Rejected(RejectReason::OutOfBounds {
                    target: decision.target,
                    min,
                    max,
                }));
            }

            let previous = inner.target;
            inner.applied = Some(decision.clone());
            inner.target = decision.target;
            inner.provision_failures = 0;

            let (ready, provisioning) = inner.active_counts();
            let active = ready + provisioning;
            let result = if decision.target > active {
                (decision.target - active, Vec::new(), Vec::new())
            } else {
                let excess = active - decision.target;
                let cancelled = cancel_provisioning(&mut inner, excess.min(provisioning));
                let excess = (excess - cancelled.len() as u32).min(ready);
                (0, cancelled, self.begin_drain(&mut inner, excess, now))
            };
            self.publish_if_changed(&mut inner, now);

            info!(
                target = decision.target,
                previous,
                reason = %decision.reason,
                ready,
                provisioning,
                "applying scaling decision"
            );
            result
        };

        if let Err(e) = self.state.put_applied_decision(&decision) {
            warn!(error = %e, "failed to persist applied decision");
        }

        let (provisioned, failed) = self.provision_many(to_provision, now).await;
        Ok(ScaleOutcome {
            target: decision.target,
            provisioned,
            cancelled,
            draining,
            failed,
        })
    }

    /// Move up to `count` Ready instances to Draining: unhealthy first, then
    /// lowest load, then oldest.
    fn begin_drain(&self, inner: &mut PoolInner, count: u32, now: u64) -> Vec<InstanceId> {
        if count == 0 {
            return Vec::new();
        }

        // Loads are sampled once so the ordering stays total while probes
        // keep writing.
        let mut candidates: Vec<(bool, f64, u64, u64, InstanceId)> = inner
            .instances
            .values()
            .filter(|i| i.state == LifecycleState::Ready)
            .map(|i| {
                (
                    i.health != HealthStatus::Unhealthy,
                    i.gauges.load(),
                    i.created_at,
                    i.seq,
                    i.id.clone(),
                )
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.total_cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| a.3.cmp(&b.3))
        });

        let deadline = now.saturating_add(millis(self.settings.drain_deadline));
        let mut drained = Vec::new();
        for (_, load, _, _, id) in candidates.into_iter().take(count as usize) {
            if let Some(inst) = inner.instances.get_mut(&id) {
                inst.state = LifecycleState::Draining;
                inst.drain_deadline = Some(deadline);
                info!(instance_id = %id, load, in_flight = inst.gauges.in_flight(), "instance draining");
                drained.push(id);
            }
        }
        drained
    }

    async fn provision_many(&self, count: u32, now: u64) -> (Vec<InstanceId>, u32) {
        let mut provisioned = Vec::new();
        let mut failed = 0;
        for _ in 0..count {
            if self.lock().provision_failures >= self.settings.max_provision_attempts {
                warn!(
                    attempts = self.settings.max_provision_attempts,
                    "provisioning suspended after repeated failures"
                );
                break;
            }
            match self.provision_one(now).await {
                Ok(id) => provisioned.push(id),
                Err(_) => failed += 1,
            }
        }
        (provisioned, failed)
    }

    async fn provision_one(&self, now: u64) -> PoolResult<InstanceId> {
        let id = {
            let mut inner = self.lock();
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let id = format!("worker-{seq:04}");
            inner
                .instances
                .insert(id.clone(), WorkerInstance::provisioning(id.clone(), seq, now));
            id
        };

        match self.provisioner.provision(&id).await {
            Ok(endpoint) => {
                let mut inner = self.lock();
                inner.provision_failures = 0;
                if let Some(inst) = inner.instances.get_mut(&id) {
                    inst.endpoint = Some(endpoint.clone());
                }
                info!(instance_id = %id, %endpoint, "instance provisioning");
                Ok(id)
            }
            Err(e) => {
                let mut inner = self.lock();
                inner.instances.remove(&id);
                inner.provision_failures += 1;
                warn!(
                    instance_id = %id,
                    error = %e,
                    failures = inner.provision_failures,
                    "provisioning failed"
                );
                Err(e)
            }
        }
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Apply a probe report: update gauges and health, promote a
    /// provisioning instance on its first healthy report.
    pub fn record_probe(&self, report: &HealthReport) {
        let mut inner = self.lock();
        let Some(inst) = inner.instances.get_mut(&report.instance_id) else {
            debug!(instance_id = %report.instance_id, "probe report for unknown instance");
            return;
        };
        if let Some(load) = report.load {
            inst.gauges.record_load(load, report.probed_at);
        }
        inst.consecutive_failures = report.consecutive_failures;
        set_health(inst, report.status, report.probed_at);
        self.publish_if_changed(&mut inner, report.probed_at);
    }

    /// Force an instance out of the snapshot until a later healthy report.
    pub fn mark_unhealthy(&self, id: &str) -> PoolResult<()> {
        self.override_health(id, HealthStatus::Unhealthy)
    }

    /// Force an instance back to healthy.
    pub fn mark_healthy(&self, id: &str) -> PoolResult<()> {
        self.override_health(id, HealthStatus::Healthy)
    }

    fn override_health(&self, id: &str, status: HealthStatus) -> PoolResult<()> {
        let now = epoch_millis();
        let mut inner = self.lock();
        let inst = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| PoolError::InstanceNotFound(id.to_string()))?;
        set_health(inst, status, now);
        self.publish_if_changed(&mut inner, now);
        Ok(())
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// One maintenance pass at time `now` (Unix millis).
    ///
    /// Completes drains, terminates instances stuck in provisioning,
    /// replaces long-unhealthy instances, and tops the pool back up to the
    /// target within the provisioning attempt budget.
    pub async fn reconcile(&self, now: u64) -> MaintenanceReport {
        let _ops = self.ops.lock().await;
        let mut report = MaintenanceReport::default();

        let provisioning_timeout = millis(self.settings.provisioning_timeout);
        let replace_after = millis(self.settings.unhealthy_replace_after);
        let drain_deadline = now.saturating_add(millis(self.settings.drain_deadline));

        let (finished, deficit) = {
            let mut inner = self.lock();
            let mut finished = Vec::new();
            let mut timeouts = 0;

            for inst in inner.instances.values_mut() {
                match inst.state {
                    LifecycleState::Draining => {
                        let in_flight = inst.gauges.in_flight();
                        let expired = inst.drain_deadline.is_some_and(|d| now >= d);
                        if in_flight == 0 || expired {
                            if in_flight > 0 {
                                warn!(instance_id = %inst.id, in_flight, "drain deadline reached; terminating");
                            }
                            inst.state = LifecycleState::Terminated;
                            report.terminated.push(inst.id.clone());
                            finished.push((inst.id.clone(), inst.endpoint.clone()));
                        }
                    }
                    LifecycleState::Provisioning => {
                        if now.saturating_sub(inst.created_at) >= provisioning_timeout {
                            let err = PoolError::ProvisioningTimeout(inst.id.clone());
                            warn!(instance_id = %inst.id, error = %err, "terminating instance");
                            inst.state = LifecycleState::Terminated;
                            report.timed_out.push(inst.id.clone());
                            finished.push((inst.id.clone(), inst.endpoint.clone()));
                            timeouts += 1;
                        }
                    }
                    LifecycleState::Ready => {
                        if inst
                            .unhealthy_since
                            .is_some_and(|since| now.saturating_sub(since) >= replace_after)
                        {
                            warn!(instance_id = %inst.id, "instance unhealthy too long; replacing");
                            inst.state = LifecycleState::Draining;
                            inst.drain_deadline = Some(drain_deadline);
                            report.replaced_unhealthy.push(inst.id.clone());
                        }
                    }
                    LifecycleState::Terminated => {
                        finished.push((inst.id.clone(), inst.endpoint.clone()));
                    }
                }
            }

            inner.provision_failures += timeouts;
            self.publish_if_changed(&mut inner, now);

            let (ready, provisioning) = inner.active_counts();
            (finished, inner.target.saturating_sub(ready + provisioning))
        };

        for (id, endpoint) in finished {
            if let Some(endpoint) = endpoint
                && let Err(e) = self.provisioner.terminate(&id, &endpoint).await
            {
                warn!(instance_id = %id, error = %e, "terminate failed");
            }
            self.lock().instances.remove(&id);
            info!(instance_id = %id, "instance terminated");
        }

        if deficit > 0 {
            let (provisioned, failed) = self.provision_many(deficit, now).await;
            report.provisioned = provisioned;
            report.provision_failures = failed;
        }

        report
    }

    /// Run maintenance on the configured interval until shutdown, keeping
    /// the health monitor's probe set aligned with the pool.
    pub async fn run_maintenance(
        self: Arc<Self>,
        monitor: Option<Arc<HealthMonitor>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.settings.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval = ?self.settings.maintenance_interval, "pool maintenance started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.reconcile(epoch_millis()).await;
                    if !report.is_empty() {
                        debug!(?report, "maintenance pass");
                    }
                    if let Some(monitor) = &monitor {
                        monitor.reconcile(&self.probe_targets()).await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("pool maintenance shutting down");
                    break;
                }
            }
        }
    }

    /// Instances the health monitor should be probing.
    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        self.lock()
            .instances
            .values()
            .filter(|i| i.state != LifecycleState::Terminated)
            .filter_map(|i| {
                Some(ProbeTarget {
                    id: i.id.clone(),
                    endpoint: i.endpoint.clone()?,
                })
            })
            .collect()
    }

    // ── Snapshot ───────────────────────────────────────────────────

    /// Publish a new snapshot if routable membership differs from the
    /// current one. Must be called with the inner lock held.
    fn publish_if_changed(&self, inner: &mut PoolInner, now: u64) -> bool {
        let current = self.snapshot.load();
        let unchanged = {
            let next = inner.instances.values().filter(|i| i.is_routable());
            let members = current.entries.iter().map(|e| &e.id);
            next.map(|i| &i.id).eq(members)
        };
        if unchanged {
            return false;
        }

        inner.version += 1;
        let snapshot = PoolSnapshot::build(inner.version, now, inner.instances.values());
        let members = snapshot.len();
        self.snapshot.store(Arc::new(snapshot));

        if let Err(e) = self.state.put_checkpoint(&PoolCheckpoint {
            snapshot_version: inner.version,
            updated_at: now,
        }) {
            warn!(version = inner.version, error = %e, "failed to persist snapshot version");
        }
        info!(version = inner.version, members, "pool snapshot published");
        true
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.lock();
        PoolStatus {
            snapshot_version: self.snapshot.load().version,
            target: inner.target,
            ready: inner.count(LifecycleState::Ready),
            provisioning: inner.count(LifecycleState::Provisioning),
            draining: inner.count(LifecycleState::Draining),
            last_decision: inner.applied.clone(),
            instances: inner
                .instances
                .values()
                .filter(|i| i.state != LifecycleState::Terminated)
                .map(WorkerInstance::view)
                .collect(),
        }
    }
}

impl HealthReporter for WorkerPool {
    fn report(&self, report: HealthReport) {
        self.record_probe(&report);
    }
}

fn set_health(inst: &mut WorkerInstance, status: HealthStatus, at: u64) {
    if status == HealthStatus::Unhealthy {
        if inst.health != HealthStatus::Unhealthy {
            warn!(instance_id = %inst.id, "instance unhealthy; removed from routing");
            inst.unhealthy_since = Some(at);
        }
    } else {
        inst.unhealthy_since = None;
    }
    inst.health = status;

    if inst.state == LifecycleState::Provisioning
        && status == HealthStatus::Healthy
        && inst.endpoint.is_some()
    {
        inst.state = LifecycleState::Ready;
        info!(instance_id = %inst.id, "instance ready");
    }
}

/// Mark the `count` newest provisioning instances terminated. The next
/// maintenance pass releases them through the provisioner.
fn cancel_provisioning(inner: &mut PoolInner, count: u32) -> Vec<InstanceId> {
    let mut newest: Vec<(u64, InstanceId)> = inner
        .instances
        .values()
        .filter(|i| i.state == LifecycleState::Provisioning)
        .map(|i| (i.seq, i.id.clone()))
        .collect();
    newest.sort_by(|a, b| b.0.cmp(&a.0));

    let mut cancelled = Vec::new();
    for (_, id) in newest.into_iter().take(count as usize) {
        if let Some(inst) = inner.instances.get_mut(&id) {
            inst.state = LifecycleState::Terminated;
            info!(instance_id = %id, "provisioning cancelled");
            cancelled.push(id);
        }
    }
    cancelled
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
