//! fleetgrid-pool: the worker pool and its published snapshots.
//!
//! The pool owns every [`WorkerInstance`] and is the only writer of
//! lifecycle state. Admission reads the latest [`PoolSnapshot`] without
//! locking; a new snapshot (version + 1) is published atomically whenever
//! the routable membership changes.

pub mod error;
pub mod instance;
pub mod pool;
pub mod provisioner;
pub mod snapshot;

pub use error::{PoolError, PoolResult, RejectReason};
pub use instance::{InstanceGauges, InstanceView, WorkerInstance};
pub use pool::{MaintenanceReport, PoolStatus, ScaleOutcome, WorkerPool};
pub use provisioner::{Provisioner, StaticProvisioner};
pub use snapshot::{PoolSnapshot, SnapshotEntry};
