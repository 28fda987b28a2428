//! fleetgrid-health: health probing for FleetGrid worker instances.
//!
//! Probes each worker's readiness endpoint on a fixed interval, folds the
//! outcomes through a consecutive-failure/consecutive-success tracker, and
//! reports status and load to the pool. The probe never changes pool
//! membership; only the pool decides termination.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── One background task per instance (parallel)
//!   │   ├── HealthCheckable::probe() → ProbeResult (bounded by timeout)
//!   │   ├── HealthTracker (K failures → Unhealthy, M successes → Healthy)
//!   │   └── HealthReporter::report(HealthReport)
//!   └── reconcile(targets) starts/stops loops as membership changes
//! ```

pub mod checker;
pub mod monitor;

pub use checker::{HealthCheckable, HealthTracker, HttpReadinessProbe, ProbeResult};
pub use monitor::{HealthMonitor, HealthReport, HealthReporter, ProbeSettings, ProbeTarget};
