//! fleetgrid-data: read/write splitting across one primary and N replicas.
//!
//! Writes and consistency-sensitive reads always go to the primary. Other
//! reads go to the least-lagged replica whose lag estimate is fresh and
//! under the configured bound, falling back to the primary when none is.

pub mod error;
pub mod introspect;
pub mod router;

pub use error::{DataError, DataResult};
pub use introspect::{HttpLagIntrospector, LagIntrospector};
pub use router::{DataRouter, Query, QueryKind, ReadConsistency, RefreshReport, ReplicaLagEstimate, Route};
