//! fleetgrid-cache: routes cache operations to shards of a shared cluster.
//!
//! Keys map to shards through a consistent-hash ring with virtual nodes, so
//! resizing the cluster only moves keys on the affected arcs. Every write
//! carries a version from a monotonic [`VersionClock`]; shards apply
//! last-writer-wins by version, and invalidation leaves a versioned
//! tombstone that blocks delayed older writes.

pub mod clock;
pub mod error;
pub mod node;
pub mod ring;
pub mod router;

pub use clock::VersionClock;
pub use error::{CacheError, CacheResult};
pub use node::{CacheNode, CachedValue, MemoryCacheNode, PutOutcome};
pub use ring::{HashRing, ShardMap};
pub use router::CacheRouter;
