//! fleetgrid-admission: request admission for the worker pool.
//!
//! Every request is placed on the routable instance with the lowest
//! `(in_flight + 1) × (1 + load)` score, subject to a per-instance in-flight
//! ceiling. When no instance has room the request waits in a bounded queue
//! or is rejected with [`AdmissionError::CapacityExhausted`]. Sessions are
//! pinned to an instance through an [`AffinityStore`] while it stays
//! routable. [`FrontDoor`] exposes the router as an HTTP/1 reverse proxy.

pub mod affinity;
pub mod error;
pub mod front_door;
pub mod router;

pub use affinity::{AffinityStore, CacheAffinityStore};
pub use error::{AdmissionError, AdmissionResult, CapacityReason};
pub use front_door::{FrontDoor, session_token};
pub use router::{AdmissionCounters, AdmissionRouter, AdmissionStats, Admitted, Lease, SnapshotSource};
