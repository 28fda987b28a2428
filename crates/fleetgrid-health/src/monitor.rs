//! Health monitor: background tasks that probe every tracked instance.
//!
//! The `HealthMonitor` spawns one task per instance. Each task probes the
//! readiness endpoint on a fixed interval, feeds the outcome through a
//! [`HealthTracker`], and hands a [`HealthReport`] to the pool after every
//! probe so load and status stay current.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleet_core::HealthSettings;
use fleetgrid_state::{HealthStatus, InstanceId, epoch_millis};

use crate::checker::{HealthCheckable, HealthTracker, ProbeResult};

/// Probe cadence and thresholds for one monitor task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl From<&HealthSettings> for ProbeSettings {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            interval: settings.interval,
            timeout: settings.timeout,
            unhealthy_threshold: settings.unhealthy_threshold,
            healthy_threshold: settings.healthy_threshold,
        }
    }
}

/// An instance the monitor should probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub id: InstanceId,
    /// Worker address (ip:port).
    pub endpoint: String,
}

/// Outcome of one probe, after threshold evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub instance_id: InstanceId,
    pub status: HealthStatus,
    pub previous: HealthStatus,
    /// Worker-reported load; `None` when the probe failed.
    pub load: Option<f64>,
    pub consecutive_failures: u32,
    /// Unix timestamp (milliseconds).
    pub probed_at: u64,
}

impl HealthReport {
    pub fn status_changed(&self) -> bool {
        self.status != self.previous
    }
}

/// Receives probe reports. Implemented by the worker pool.
pub trait HealthReporter: Send + Sync {
    fn report(&self, report: HealthReport);
}

/// Per-instance monitor state.
struct MonitorSlot {
    endpoint: String,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages probe tasks for every instance in the pool.
pub struct HealthMonitor {
    probe: Arc<dyn HealthCheckable>,
    reporter: Arc<dyn HealthReporter>,
    settings: ProbeSettings,
    /// Active monitors: instance_id → slot.
    monitors: Arc<RwLock<HashMap<InstanceId, MonitorSlot>>>,
}

impl HealthMonitor {
    pub fn new(
        probe: Arc<dyn HealthCheckable>,
        reporter: Arc<dyn HealthReporter>,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            probe,
            reporter,
            settings,
            monitors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start probing an instance. Replaces any monitor already running for it.
    pub async fn start_monitor(&self, target: &ProbeTarget) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let target_owned = target.clone();
        let probe = Arc::clone(&self.probe);
        let reporter = Arc::clone(&self.reporter);
        let settings = self.settings.clone();

        let handle = tokio::spawn(async move {
            run_probe_loop(target_owned, probe, reporter, settings, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            target.id.clone(),
            MonitorSlot {
                endpoint: target.endpoint.clone(),
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(instance_id = %target.id, endpoint = %target.endpoint, "health monitor started");
    }

    /// Stop probing an instance.
    pub async fn stop_monitor(&self, instance_id: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(instance_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%instance_id, "health monitor stopped");
        }
    }

    /// Align running monitors with `targets`: start missing ones, stop
    /// monitors for instances no longer listed, restart on endpoint change.
    pub async fn reconcile(&self, targets: &[ProbeTarget]) {
        let current: HashMap<InstanceId, String> = {
            let monitors = self.monitors.read().await;
            monitors
                .iter()
                .map(|(id, slot)| (id.clone(), slot.endpoint.clone()))
                .collect()
        };

        for id in current.keys() {
            if !targets.iter().any(|t| &t.id == id) {
                self.stop_monitor(id).await;
            }
        }

        for target in targets {
            match current.get(&target.id) {
                Some(endpoint) if *endpoint == target.endpoint => {}
                _ => self.start_monitor(target).await,
            }
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (id, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(instance_id = %id, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    /// List instance IDs with active monitors.
    pub async fn active_monitors(&self) -> Vec<InstanceId> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, instance_id: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(instance_id)
    }
}

/// The probe loop for a single instance.
async fn run_probe_loop(
    target: ProbeTarget,
    probe: Arc<dyn HealthCheckable>,
    reporter: Arc<dyn HealthReporter>,
    settings: ProbeSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = HealthTracker::new(settings.unhealthy_threshold, settings.healthy_threshold);
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    debug!(instance_id = %target.id, endpoint = %target.endpoint, "probe loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = match tokio::time::timeout(
                    settings.timeout,
                    probe.probe(&target.endpoint),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(instance_id = %target.id, "readiness probe timed out");
                        ProbeResult::Failed
                    }
                };

                let previous = tracker.status();
                let status = tracker.record(&result);
                let report = HealthReport {
                    instance_id: target.id.clone(),
                    status,
                    previous,
                    load: result.load(),
                    consecutive_failures: tracker.consecutive_failures(),
                    probed_at: epoch_millis(),
                };
                if report.status_changed() {
                    warn!(
                        instance_id = %target.id,
                        from = %previous,
                        to = %status,
                        "instance health changed"
                    );
                }
                reporter.report(report);
            }
            _ = shutdown.changed() => {
                debug!(instance_id = %target.id, "probe loop shutting down");
                break;
            }
        }
    }
}
