//! Consistent hash ring over cache shards.

use std::collections::BTreeSet;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Consistent hash ring with virtual nodes.
///
/// Each shard owns `virtual_nodes` points on a 64-bit circle; a key belongs
/// to the first point at or after its own hash (wrapping). Points come from
/// SHA-256, so placement is stable across processes and releases.
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: u32,
    shards: BTreeSet<String>,
    /// (point, index into `shard_list`), sorted by point.
    points: Vec<(u64, usize)>,
    shard_list: Vec<String>,
}

/// Ring membership, for callers that re-route on resize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardMap {
    pub shards: Vec<String>,
    pub virtual_nodes: u32,
    pub points: usize,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            shards: BTreeSet::new(),
            points: Vec::new(),
            shard_list: Vec::new(),
        }
    }

    pub fn with_shards(virtual_nodes: u32, shards: impl IntoIterator<Item = String>) -> Self {
        let mut ring = Self::new(virtual_nodes);
        ring.rebuild(shards);
        ring
    }

    /// Replace the shard set. No-op when membership is unchanged.
    pub fn rebuild(&mut self, shards: impl IntoIterator<Item = String>) {
        let next: BTreeSet<String> = shards.into_iter().collect();
        if next == self.shards {
            return;
        }
        self.shards = next;
        self.rebuild_points();
    }

    pub fn add_shard(&mut self, shard: String) {
        if self.shards.insert(shard) {
            self.rebuild_points();
        }
    }

    pub fn remove_shard(&mut self, shard: &str) {
        if self.shards.remove(shard) {
            self.rebuild_points();
        }
    }

    fn rebuild_points(&mut self) {
        self.shard_list = self.shards.iter().cloned().collect();
        self.points = self
            .shard_list
            .iter()
            .enumerate()
            .flat_map(|(idx, shard)| {
                (0..self.virtual_nodes).map(move |v| (hash64(format!("{shard}#{v}").as_bytes()), idx))
            })
            .collect();
        self.points.sort_unstable();
    }

    /// Shard that owns `key`, or `None` for an empty ring.
    pub fn shard_for(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash64(key.as_bytes());
        let idx = self.points.partition_point(|(point, _)| *point < h);
        let (_, shard) = self.points[idx % self.points.len()];
        Some(self.shard_list[shard].as_str())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shards(&self) -> &[String] {
        &self.shard_list
    }

    pub fn shard_map(&self) -> ShardMap {
        ShardMap {
            shards: self.shard_list.clone(),
            virtual_nodes: self.virtual_nodes,
            points: self.points.len(),
        }
    }
}

/// First 8 bytes of SHA-256, big-endian.
fn hash64(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}
