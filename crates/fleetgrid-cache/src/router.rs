//! CacheRouter: shard selection plus versioned writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::clock::VersionClock;
use crate::error::{CacheError, CacheResult};
use crate::node::{CacheNode, PutOutcome};
use crate::ring::{HashRing, ShardMap};

/// Ring and node handles, swapped together on resize.
struct Topology {
    ring: HashRing,
    nodes: HashMap<String, Arc<dyn CacheNode>>,
}

/// Routes cache operations to the owning shard.
pub struct CacheRouter {
    virtual_nodes: u32,
    topology: ArcSwap<Topology>,
    clock: VersionClock,
}

impl CacheRouter {
    pub fn new(virtual_nodes: u32, nodes: Vec<Arc<dyn CacheNode>>) -> Self {
        Self {
            virtual_nodes,
            topology: ArcSwap::from_pointee(build_topology(virtual_nodes, nodes)),
            clock: VersionClock::new(),
        }
    }

    /// Replace the shard set. Keys on unaffected arcs keep their shard.
    pub fn resize(&self, nodes: Vec<Arc<dyn CacheNode>>) {
        let next = build_topology(self.virtual_nodes, nodes);
        let shards = next.ring.shard_count();
        self.topology.store(Arc::new(next));
        info!(shards, "cache ring rebuilt");
    }

    pub fn shard_map(&self) -> ShardMap {
        self.topology.load().ring.shard_map()
    }

    pub fn shard_for(&self, key: &str) -> Option<String> {
        self.topology.load().ring.shard_for(key).map(str::to_string)
    }

    fn node_for(&self, key: &str) -> CacheResult<Arc<dyn CacheNode>> {
        let topology = self.topology.load();
        let shard = topology.ring.shard_for(key).ok_or(CacheError::NoShards)?;
        topology
            .nodes
            .get(shard)
            .cloned()
            .ok_or_else(|| CacheError::ShardUnavailable(shard.to_string()))
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let node = self.node_for(key)?;
        Ok(node.get(key).await?.map(|cached| cached.value))
    }

    /// Write with a fresh version. Returns the version used.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<u64> {
        let version = self.clock.next();
        self.set_versioned(key, value, ttl, version).await?;
        Ok(version)
    }

    /// Write with a caller-chosen version. A lower version than the stored
    /// one is refused by the shard.
    pub async fn set_versioned(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        version: u64,
    ) -> CacheResult<PutOutcome> {
        let node = self.node_for(key)?;
        let outcome = node.put(key, value, ttl, version).await?;
        if let PutOutcome::Superseded { current } = outcome {
            debug!(key, version, current, shard = node.name(), "cache write superseded");
        }
        Ok(outcome)
    }

    /// Tombstone `key` at a fresh version. Returns the version used.
    pub async fn invalidate(&self, key: &str) -> CacheResult<u64> {
        let version = self.clock.next();
        let node = self.node_for(key)?;
        match node.invalidate(key, version).await {
            Ok(_) => Ok(version),
            Err(e) => {
                warn!(key, shard = node.name(), error = %e, "cache invalidation failed");
                Err(e)
            }
        }
    }

    pub fn clock(&self) -> &VersionClock {
        &self.clock
    }
}

fn build_topology(virtual_nodes: u32, nodes: Vec<Arc<dyn CacheNode>>) -> Topology {
    let nodes: HashMap<String, Arc<dyn CacheNode>> = nodes
        .into_iter()
        .map(|node| (node.name().to_string(), node))
        .collect();
    let ring = HashRing::with_shards(virtual_nodes, nodes.keys().cloned());
    Topology { ring, nodes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MemoryCacheNode;

    fn nodes(n: usize) -> Vec<Arc<MemoryCacheNode>> {
        (1..=n)
            .map(|i| Arc::new(MemoryCacheNode::new(format!("shard-{i}"), Duration::from_secs(60))))
            .collect()
    }

    fn dyn_nodes(nodes: &[Arc<MemoryCacheNode>]) -> Vec<Arc<dyn CacheNode>> {
        nodes
            .iter()
            .map(|n| Arc::clone(n) as Arc<dyn CacheNode>)
            .collect()
    }

    #[tokio::test]
    async fn empty_router_reports_no_shards() {
        let router = CacheRouter::new(128, Vec::new());
        assert!(matches!(router.get("k").await, Err(CacheError::NoShards)));
        assert!(matches!(
            router.set("k", Bytes::from_static(b"v"), None).await,
            Err(CacheError::NoShards)
        ));
    }

    #[tokio::test]
    async fn set_get_invalidate() {
        let router = CacheRouter::new(128, dyn_nodes(&nodes(3)));
        let v1 = router.set("user:1", Bytes::from_static(b"alice"), None).await.unwrap();
        assert_eq!(router.get("user:1").await.unwrap(), Some(Bytes::from_static(b"alice")));

        let v2 = router.invalidate("user:1").await.unwrap();
        assert!(v2 > v1);
        assert_eq!(router.get("user:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn writes_land_on_the_owning_shard() {
        let shards = nodes(4);
        let router = CacheRouter::new(128, dyn_nodes(&shards));
        for i in 0..50 {
            let key = format!("k{i}");
            router.set(&key, Bytes::from(key.clone()), None).await.unwrap();
            let owner = router.shard_for(&key).unwrap();
            let node = shards.iter().find(|n| n.name() == owner).unwrap();
            assert!(node.get(&key).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn out_of_order_versioned_writes_keep_newest() {
        let router = CacheRouter::new(128, dyn_nodes(&nodes(2)));
        router
            .set_versioned("k", Bytes::from_static(b"v2"), None, 200)
            .await
            .unwrap();
        let late = router
            .set_versioned("k", Bytes::from_static(b"v1"), None, 100)
            .await
            .unwrap();
        assert_eq!(late, PutOutcome::Superseded { current: 200 });
        assert_eq!(router.get("k").await.unwrap(), Some(Bytes::from_static(b"v2")));
    }

    #[tokio::test]
    async fn invalidation_blocks_stale_set() {
        let router = CacheRouter::new(128, dyn_nodes(&nodes(2)));
        let v1 = router.set("k", Bytes::from_static(b"a"), None).await.unwrap();
        router.invalidate("k").await.unwrap();
        // A delayed writer replays its old version.
        let outcome = router
            .set_versioned("k", Bytes::from_static(b"a"), None, v1)
            .await
            .unwrap();
        assert!(!outcome.applied());
        assert_eq!(router.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn resize_updates_shard_map() {
        let shards = nodes(5);
        let router = CacheRouter::new(64, dyn_nodes(&shards[..4]));
        assert_eq!(router.shard_map().shards.len(), 4);

        router.resize(dyn_nodes(&shards));
        let map = router.shard_map();
        assert_eq!(map.shards.len(), 5);
        assert_eq!(map.points, 5 * 64);
    }

    #[tokio::test]
    async fn unavailable_shard_surfaces_error() {
        let shards = nodes(1);
        let router = CacheRouter::new(128, dyn_nodes(&shards));
        shards[0].set_available(false);
        assert!(matches!(
            router.get("k").await,
            Err(CacheError::ShardUnavailable(_))
        ));
    }
}
