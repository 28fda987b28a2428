//! Autoscaler: utilization-driven pool sizing.
//!
//! Each tick reads the ready count and aggregate load from the latest pool
//! snapshot, computes `ceil(ready * load / target_utilization)` clamped to
//! the pool bounds, and hands the resulting `ScalingDecision` to the pool
//! when it changes the target.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_core::AutoscaleSettings;
use fleetgrid_pool::WorkerPool;
use fleetgrid_state::*;

/// Returns the cumulative number of requests rejected for capacity.
///
/// The autoscaler takes the delta between ticks.
pub type RejectionCounter = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Guards against float noise turning an exact ratio into one extra instance.
const CEIL_EPSILON: f64 = 1e-9;

/// What one evaluation sees.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingInput {
    /// Routable instances in the current snapshot.
    pub ready: u32,
    /// Mean utilization over fresh samples; `None` when nothing is fresh.
    pub load: Option<f64>,
    /// Capacity rejections since the previous tick.
    pub rejected: u64,
    /// Target the pool is currently working toward.
    pub current_target: u32,
    /// Instances still provisioning toward the target.
    pub provisioning: u32,
    /// Ready instances held out of the snapshot as unhealthy.
    pub unhealthy: u32,
}

/// The autoscaler evaluates utilization and decides the pool size.
pub struct Autoscaler {
    settings: AutoscaleSettings,
    min_instances: u32,
    max_instances: u32,
    /// When `desired < ready` first became true in the current streak.
    below_since: Option<u64>,
    last_decided_at: u64,
    rejections: Option<RejectionCounter>,
    last_rejections: u64,
}

impl Autoscaler {
    pub fn new(settings: AutoscaleSettings, min_instances: u32, max_instances: u32) -> Self {
        Self {
            settings,
            min_instances,
            max_instances,
            below_since: None,
            last_decided_at: 0,
            rejections: None,
            last_rejections: 0,
        }
    }

    /// Feed admission rejections into emergency scale-up.
    pub fn with_rejections(mut self, counter: RejectionCounter) -> Self {
        self.last_rejections = counter();
        self.rejections = Some(counter);
        self
    }

    /// Evaluate one tick at `now` (Unix millis).
    pub fn evaluate(&mut self, input: &ScalingInput, now: u64) -> ScalingDecision {
        let decided_at = now.max(self.last_decided_at + 1);
        self.last_decided_at = decided_at;

        let (min, max) = (self.min_instances, self.max_instances);
        let hold = input.current_target.clamp(min, max);
        let decision = |target: u32, reason: ReasonCode, desired: u32| ScalingDecision {
            target,
            reason,
            decided_at,
            observed_ready: input.ready,
            desired,
            aggregate_load: input.load,
        };

        if input.ready == 0 {
            self.below_since = None;
            if min > 0 || input.rejected > 0 {
                // Unhealthy members still count toward the target, so the
                // floor is added on top of them unless provisioning covers it.
                let floor = min.max(1).min(max);
                let target = (input.unhealthy + floor.max(input.provisioning))
                    .min(max)
                    .max(hold);
                return decision(target, ReasonCode::EmergencyScaleUp, floor);
            }
            // Scale-to-zero with no demand.
            return decision(hold, ReasonCode::Steady, 0);
        }

        let Some(load) = input.load else {
            return decision(hold, ReasonCode::NoMetrics, hold);
        };

        let desired = self.desired(input.ready, load);
        if desired > input.ready {
            self.below_since = None;
            // Pending capacity already covers it; never lower the target here.
            if desired <= hold {
                return decision(hold, ReasonCode::Steady, desired);
            }
            return decision(desired, ReasonCode::ScaleUp, desired);
        }
        if desired == input.ready {
            self.below_since = None;
            return decision(hold, ReasonCode::Steady, desired);
        }

        let since = *self.below_since.get_or_insert(now);
        let cooldown = u64::try_from(self.settings.scale_down_cooldown.as_millis())
            .unwrap_or(u64::MAX);
        if now.saturating_sub(since) >= cooldown {
            self.below_since = None;
            decision(desired, ReasonCode::ScaleDown, desired)
        } else {
            decision(hold, ReasonCode::CooldownPending, desired)
        }
    }

    /// `ceil(ready * load / target)` clamped to the pool bounds.
    fn desired(&self, ready: u32, load: f64) -> u32 {
        let raw = f64::from(ready) * load.max(0.0) / self.settings.target_utilization;
        let ceiled = (raw - CEIL_EPSILON).ceil().max(0.0);
        let bounded = ceiled.min(f64::from(self.max_instances)) as u32;
        bounded.clamp(self.min_instances, self.max_instances)
    }

    fn take_rejections(&mut self) -> u64 {
        let Some(counter) = &self.rejections else {
            return 0;
        };
        let total = counter();
        let delta = total.saturating_sub(self.last_rejections);
        self.last_rejections = total;
        delta
    }

    /// Evaluate against the pool and apply the decision if it changes the
    /// target. Returns the decision either way.
    pub async fn tick(&mut self, pool: &WorkerPool) -> ScalingDecision {
        let now = epoch_millis();
        // Stay ahead of decisions applied by other producers.
        if let Some(applied) = pool.applied_decision() {
            self.last_decided_at = self.last_decided_at.max(applied.decided_at);
        }

        let snapshot = pool.current_snapshot();
        let status = pool.status();
        let ready = snapshot.len() as u32;
        let max_age = u64::try_from(self.settings.metrics_max_age.as_millis()).unwrap_or(u64::MAX);
        let input = ScalingInput {
            ready,
            load: snapshot.aggregate_load(now, max_age),
            rejected: self.take_rejections(),
            current_target: status.target,
            provisioning: status.provisioning,
            unhealthy: status.ready.saturating_sub(ready),
        };

        let decision = self.evaluate(&input, now);
        debug!(
            ready = input.ready,
            load = ?input.load,
            rejected = input.rejected,
            desired = decision.desired,
            target = decision.target,
            reason = %decision.reason,
            "autoscaler evaluated"
        );

        if decision.changes(input.current_target) {
            match pool.apply_scaling_decision(decision.clone()).await {
                Ok(outcome) => info!(
                    from = input.current_target,
                    to = decision.target,
                    reason = %decision.reason,
                    provisioned = outcome.provisioned.len(),
                    draining = outcome.draining.len(),
                    "scaling decision applied"
                ),
                Err(e) => warn!(
                    target = decision.target,
                    reason = %decision.reason,
                    error = %e,
                    "scaling decision not applied"
                ),
            }
        }
        decision
    }

    /// Run the autoscaler loop. Ticks are serialized; missed ticks are
    /// skipped rather than bunched.
    pub async fn run(
        &mut self,
        pool: Arc<WorkerPool>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval = ?interval, "autoscaler started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&pool).await;
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use fleet_core::PoolSettings;
    use fleetgrid_health::HealthReport;
    use fleetgrid_pool::{PoolResult, Provisioner};

    const MINUTE: u64 = 60_000;

    fn scaler(min: u32, max: u32) -> Autoscaler {
        Autoscaler::new(AutoscaleSettings::default(), min, max)
    }

    fn input(ready: u32, load: Option<f64>, current_target: u32) -> ScalingInput {
        ScalingInput {
            ready,
            load,
            rejected: 0,
            current_target,
            provisioning: 0,
            unhealthy: 0,
        }
    }

    #[test]
    fn scales_up_immediately_when_over_target() {
        let mut s = scaler(1, 10);
        let d = s.evaluate(&input(2, Some(0.95), 2), 1_000);
        assert_eq!(d.reason, ReasonCode::ScaleUp);
        assert_eq!(d.target, 3);
        assert_eq!(d.observed_ready, 2);
        assert_eq!(d.aggregate_load, Some(0.95));
    }

    #[test]
    fn exact_ratio_does_not_round_up() {
        let mut s = scaler(1, 20);
        let d = s.evaluate(&input(10, Some(0.7), 10), 1_000);
        assert_eq!(d.reason, ReasonCode::Steady);
        assert_eq!(d.desired, 10);
        assert!(!d.changes(10));
    }

    #[test]
    fn desired_is_clamped_to_bounds() {
        let mut s = scaler(2, 5);
        let d = s.evaluate(&input(4, Some(7.0), 4), 1_000);
        assert_eq!(d.target, 5);

        let d = s.evaluate(&input(4, Some(0.0), 4), 2_000);
        assert_eq!(d.desired, 2);
    }

    #[test]
    fn scale_down_waits_for_cooldown() {
        let mut s = scaler(1, 10);
        // 5 * 0.42 / 0.7 = 3
        let t0 = 10 * MINUTE;
        let d = s.evaluate(&input(5, Some(0.42), 5), t0);
        assert_eq!(d.reason, ReasonCode::CooldownPending);
        assert_eq!(d.target, 5);
        assert_eq!(d.desired, 3);

        let d = s.evaluate(&input(5, Some(0.42), 5), t0 + 5 * MINUTE - 1);
        assert_eq!(d.reason, ReasonCode::CooldownPending);

        let d = s.evaluate(&input(5, Some(0.42), 5), t0 + 5 * MINUTE);
        assert_eq!(d.reason, ReasonCode::ScaleDown);
        assert_eq!(d.target, 3);
    }

    #[test]
    fn cooldown_window_resets_when_demand_returns() {
        let mut s = scaler(1, 10);
        let t0 = 10 * MINUTE;
        s.evaluate(&input(5, Some(0.42), 5), t0);
        // Back at capacity: the streak ends.
        let d = s.evaluate(&input(5, Some(0.7), 5), t0 + 3 * MINUTE);
        assert_eq!(d.reason, ReasonCode::Steady);

        let d = s.evaluate(&input(5, Some(0.42), 5), t0 + 6 * MINUTE);
        assert_eq!(d.reason, ReasonCode::CooldownPending);
        let d = s.evaluate(&input(5, Some(0.42), 5), t0 + 10 * MINUTE);
        assert_eq!(d.reason, ReasonCode::CooldownPending);
        let d = s.evaluate(&input(5, Some(0.42), 5), t0 + 11 * MINUTE);
        assert_eq!(d.reason, ReasonCode::ScaleDown);
    }

    /// For any load trace, a scale-down is only issued once `desired < ready`
    /// has held for the whole cooldown.
    #[test]
    fn never_scales_down_before_cooldown() {
        let loads = [0.1, 0.9, 0.3, 0.3, 0.69, 0.2, 1.5, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1];
        for step in [MINUTE / 2, MINUTE, 2 * MINUTE] {
            let mut s = scaler(1, 10);
            let mut streak_start: Option<u64> = None;
            for (i, load) in loads.iter().enumerate() {
                let now = 1_000 + i as u64 * step;
                let d = s.evaluate(&input(4, Some(*load), 4), now);
                if d.desired < 4 {
                    streak_start.get_or_insert(now);
                } else {
                    streak_start = None;
                }
                if d.reason == ReasonCode::ScaleDown {
                    let start = streak_start.unwrap();
                    assert!(now - start >= 5 * MINUTE);
                    streak_start = None;
                }
            }
        }
    }

    #[test]
    fn emergency_scale_up_with_no_ready_instances() {
        let mut s = scaler(2, 10);
        let d = s.evaluate(&input(0, None, 0), 1_000);
        assert_eq!(d.reason, ReasonCode::EmergencyScaleUp);
        assert_eq!(d.target, 2);

        // Provisioning already underway keeps its target.
        let d = s.evaluate(&input(0, None, 4), 2_000);
        assert_eq!(d.target, 4);
    }

    #[test]
    fn scale_up_never_lowers_a_pending_target() {
        let mut s = scaler(1, 10);
        // desired 3 while 3 more are still provisioning toward 5.
        let mut pending = input(2, Some(0.95), 5);
        pending.provisioning = 3;
        let d = s.evaluate(&pending, 1_000);
        assert_eq!(d.reason, ReasonCode::Steady);
        assert_eq!(d.desired, 3);
        assert_eq!(d.target, 5);
        assert!(!d.changes(5));

        // Demand beyond the pending target still scales up.
        pending.load = Some(2.0);
        let d = s.evaluate(&pending, 2_000);
        assert_eq!(d.reason, ReasonCode::ScaleUp);
        assert_eq!(d.target, 6);
    }

    #[test]
    fn emergency_adds_capacity_beside_unhealthy_members() {
        let mut s = scaler(1, 10);
        let mut all_unhealthy = input(0, None, 3);
        all_unhealthy.unhealthy = 3;
        let d = s.evaluate(&all_unhealthy, 1_000);
        assert_eq!(d.reason, ReasonCode::EmergencyScaleUp);
        assert_eq!(d.target, 4);
        assert!(d.changes(3));

        // Once the replacement is provisioning the target holds.
        all_unhealthy.current_target = 4;
        all_unhealthy.provisioning = 1;
        let d = s.evaluate(&all_unhealthy, 2_000);
        assert_eq!(d.target, 4);
        assert!(!d.changes(4));

        // Capped at the pool maximum.
        let mut s = scaler(1, 3);
        let mut capped = input(0, None, 3);
        capped.unhealthy = 3;
        assert_eq!(s.evaluate(&capped, 1_000).target, 3);
    }

    #[test]
    fn emergency_during_bring_up_keeps_target() {
        let mut s = scaler(2, 10);
        let mut booting = input(0, None, 2);
        booting.provisioning = 2;
        let d = s.evaluate(&booting, 1_000);
        assert_eq!(d.reason, ReasonCode::EmergencyScaleUp);
        assert_eq!(d.target, 2);
        assert!(!d.changes(2));
    }

    #[test]
    fn scale_to_zero_without_demand() {
        let mut s = scaler(0, 10);
        let d = s.evaluate(&input(0, None, 0), 1_000);
        assert_eq!(d.reason, ReasonCode::Steady);
        assert_eq!(d.target, 0);

        let mut rejected = input(0, None, 0);
        rejected.rejected = 3;
        let d = s.evaluate(&rejected, 2_000);
        assert_eq!(d.reason, ReasonCode::EmergencyScaleUp);
        assert_eq!(d.target, 1);
    }

    #[test]
    fn missing_metrics_hold_current_size() {
        let mut s = scaler(1, 10);
        let d = s.evaluate(&input(3, None, 3), 1_000);
        assert_eq!(d.reason, ReasonCode::NoMetrics);
        assert_eq!(d.target, 3);
        assert!(!d.changes(3));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut s = scaler(1, 10);
        let a = s.evaluate(&input(2, Some(0.5), 2), 5_000);
        let b = s.evaluate(&input(2, Some(0.5), 2), 5_000);
        let c = s.evaluate(&input(2, Some(0.5), 2), 4_000);
        assert!(a.decided_at < b.decided_at);
        assert!(b.decided_at < c.decided_at);
    }

    #[test]
    fn rejection_counter_reports_deltas() {
        let total = Arc::new(AtomicU64::new(5));
        let counter_src = Arc::clone(&total);
        let mut s = scaler(0, 10)
            .with_rejections(Arc::new(move || counter_src.load(Ordering::SeqCst)));
        assert_eq!(s.take_rejections(), 0);
        total.store(9, Ordering::SeqCst);
        assert_eq!(s.take_rejections(), 4);
        assert_eq!(s.take_rejections(), 0);
    }

    // ── Against a live pool ────────────────────────────────────────

    struct CountingProvisioner(AtomicU64);

    #[async_trait]
    impl Provisioner for CountingProvisioner {
        async fn provision(&self, _id: &str) -> PoolResult<String> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("10.1.0.{n}:8080"))
        }

        async fn terminate(&self, _id: &str, _endpoint: &str) -> PoolResult<()> {
            Ok(())
        }
    }

    async fn live_pool(loads: &[f64]) -> Arc<WorkerPool> {
        let pool = WorkerPool::new(
            PoolSettings::default(),
            Arc::new(CountingProvisioner(AtomicU64::new(0))),
            StateStore::open_in_memory().unwrap(),
        )
        .unwrap();
        let outcome = pool
            .apply_scaling_decision(ScalingDecision::manual(loads.len() as u32, 1))
            .await
            .unwrap();
        let now = epoch_millis();
        for (id, load) in outcome.provisioned.iter().zip(loads) {
            pool.record_probe(&HealthReport {
                instance_id: id.clone(),
                status: HealthStatus::Healthy,
                previous: HealthStatus::Unknown,
                load: Some(*load),
                consecutive_failures: 0,
                probed_at: now,
            });
        }
        Arc::new(pool)
    }

    #[tokio::test]
    async fn tick_applies_scale_up_to_pool() {
        let pool = live_pool(&[0.95, 0.95]).await;
        let mut s = scaler(1, 10);

        let d = s.tick(&pool).await;
        assert_eq!(d.reason, ReasonCode::ScaleUp);
        assert_eq!(pool.target(), 3);
        assert_eq!(pool.status().provisioning, 1);
        assert_eq!(pool.applied_decision().unwrap().reason, ReasonCode::ScaleUp);
    }

    #[tokio::test]
    async fn tick_does_not_send_unchanged_targets() {
        let pool = live_pool(&[0.7, 0.7]).await;
        let mut s = scaler(1, 10);

        let d = s.tick(&pool).await;
        assert_eq!(d.reason, ReasonCode::Steady);
        assert_eq!(pool.applied_decision().unwrap().reason, ReasonCode::Manual);
    }

    #[tokio::test]
    async fn tick_keeps_manual_target_while_provisioning() {
        let pool = live_pool(&[0.95, 0.95]).await;
        pool.apply_scaling_decision(ScalingDecision::manual(5, 2))
            .await
            .unwrap();
        assert_eq!(pool.status().provisioning, 3);
        let mut s = scaler(1, 10);

        let d = s.tick(&pool).await;
        assert_eq!(d.target, 5);
        assert_eq!(pool.target(), 5);
        assert_eq!(pool.status().provisioning, 3);
        assert_eq!(pool.applied_decision().unwrap().reason, ReasonCode::Manual);
    }

    #[tokio::test]
    async fn tick_replaces_capacity_when_every_instance_is_unhealthy() {
        let pool = live_pool(&[0.5, 0.5, 0.5]).await;
        let ids: Vec<_> = pool.status().instances.into_iter().map(|i| i.id).collect();
        for id in &ids {
            pool.mark_unhealthy(id).unwrap();
        }
        assert!(pool.current_snapshot().is_empty());
        let mut s = scaler(1, 10);

        let d = s.tick(&pool).await;
        assert_eq!(d.reason, ReasonCode::EmergencyScaleUp);
        assert_eq!(pool.target(), 4);
        assert_eq!(pool.status().provisioning, 1);

        // The next tick sees the replacement underway and adds nothing.
        s.tick(&pool).await;
        assert_eq!(pool.target(), 4);
        assert_eq!(pool.status().provisioning, 1);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let pool = live_pool(&[0.95, 0.95]).await;
        let (tx, rx) = watch::channel(false);
        let handle = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut s = scaler(1, 10);
                s.run(pool, Duration::from_millis(10), rx).await;
            })
        };

        for _ in 0..100 {
            if pool.target() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.target(), 3);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
