//! Cache shard contract and the in-process implementation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{CacheError, CacheResult};

/// A live value read from a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub value: Bytes,
    pub version: u64,
}

/// Whether a versioned write took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    /// A newer version (value or tombstone) is already stored.
    Superseded { current: u64 },
}

impl PutOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// One shard of the cache cluster.
///
/// Shards enforce last-writer-wins by version: a write whose version is at
/// least the stored one is applied; a lower one is refused. Expired entries
/// behave exactly like misses.
#[async_trait]
pub trait CacheNode: Send + Sync {
    /// Shard address used as its ring identity.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> CacheResult<Option<CachedValue>>;

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        version: u64,
    ) -> CacheResult<PutOutcome>;

    /// Replace the entry with a tombstone at `version`.
    async fn invalidate(&self, key: &str, version: u64) -> CacheResult<PutOutcome>;
}

#[derive(Debug, Clone)]
struct Slot {
    /// `None` marks a tombstone.
    value: Option<Bytes>,
    version: u64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory shard with TTLs, versioned LWW, and expiring tombstones.
pub struct MemoryCacheNode {
    name: String,
    tombstone_ttl: Duration,
    entries: Mutex<HashMap<String, Slot>>,
    available: AtomicBool,
}

impl MemoryCacheNode {
    pub fn new(name: impl Into<String>, tombstone_ttl: Duration) -> Self {
        Self {
            name: name.into(),
            tombstone_ttl,
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the shard going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Stored entries, including tombstones not yet expired.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|s| !s.expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries and tombstones.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, slot| !slot.expired(now));
        before - entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::ShardUnavailable(self.name.clone()))
        }
    }

    fn write(&self, key: &str, slot: Slot) -> PutOutcome {
        let now = Instant::now();
        let mut entries = self.lock();
        if let Some(existing) = entries.get(key)
            && !existing.expired(now)
            && slot.version < existing.version
        {
            debug!(shard = %self.name, key, version = slot.version, current = existing.version, "write superseded");
            return PutOutcome::Superseded {
                current: existing.version,
            };
        }
        entries.insert(key.to_string(), slot);
        PutOutcome::Applied
    }
}

#[async_trait]
impl CacheNode for MemoryCacheNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> CacheResult<Option<CachedValue>> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.lock();
        Ok(entries
            .get(key)
            .filter(|slot| !slot.expired(now))
            .and_then(|slot| {
                slot.value.clone().map(|value| CachedValue {
                    value,
                    version: slot.version,
                })
            }))
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        version: u64,
    ) -> CacheResult<PutOutcome> {
        self.check_available()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        Ok(self.write(
            key,
            Slot {
                value: Some(value),
                version,
                expires_at,
            },
        ))
    }

    async fn invalidate(&self, key: &str, version: u64) -> CacheResult<PutOutcome> {
        self.check_available()?;
        let expires_at = Some(Instant::now() + self.tombstone_ttl);
        Ok(self.write(
            key,
            Slot {
                value: None,
                version,
                expires_at,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> MemoryCacheNode {
        MemoryCacheNode::new("10.0.2.1:6379", Duration::from_secs(60))
    }

    fn bytes(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn put_then_get() {
        let node = node();
        assert!(node.put("k", bytes("v1"), None, 10).await.unwrap().applied());
        let got = node.get("k").await.unwrap().unwrap();
        assert_eq!(got.value, bytes("v1"));
        assert_eq!(got.version, 10);
        assert_eq!(node.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn higher_version_wins_in_any_order() {
        for order in [[1u64, 2], [2, 1]] {
            let node = node();
            for v in order {
                let value = if v == 2 { bytes("v2") } else { bytes("v1") };
                node.put("k", value, None, v).await.unwrap();
            }
            assert_eq!(node.get("k").await.unwrap().unwrap().value, bytes("v2"));
        }
    }

    #[tokio::test]
    async fn lower_version_is_superseded() {
        let node = node();
        node.put("k", bytes("new"), None, 20).await.unwrap();
        let outcome = node.put("k", bytes("old"), None, 19).await.unwrap();
        assert_eq!(outcome, PutOutcome::Superseded { current: 20 });
        // Equal versions are applied.
        assert!(node.put("k", bytes("same"), None, 20).await.unwrap().applied());
        assert_eq!(node.get("k").await.unwrap().unwrap().value, bytes("same"));
    }

    #[tokio::test]
    async fn tombstone_blocks_delayed_older_write() {
        let node = node();
        node.put("k", bytes("v1"), None, 1).await.unwrap();
        node.invalidate("k", 5).await.unwrap();
        assert_eq!(node.get("k").await.unwrap(), None);

        let late = node.put("k", bytes("v3"), None, 3).await.unwrap();
        assert_eq!(late, PutOutcome::Superseded { current: 5 });
        assert_eq!(node.get("k").await.unwrap(), None);

        assert!(node.put("k", bytes("v6"), None, 6).await.unwrap().applied());
        assert_eq!(node.get("k").await.unwrap().unwrap().value, bytes("v6"));
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let node = node();
        node.put("k", bytes("v"), Some(Duration::from_millis(20)), 1)
            .await
            .unwrap();
        assert!(node.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(node.get("k").await.unwrap(), None);
        // An expired entry does not block lower versions.
        assert!(node.put("k", bytes("w"), None, 0).await.unwrap().applied());
    }

    #[tokio::test]
    async fn tombstones_expire() {
        let node = MemoryCacheNode::new("n", Duration::from_millis(20));
        node.invalidate("k", 9).await.unwrap();
        assert_eq!(node.len(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(node.purge_expired(), 1);
        assert!(node.is_empty());
    }

    #[tokio::test]
    async fn unavailable_node_errors() {
        let node = node();
        node.set_available(false);
        assert!(matches!(
            node.get("k").await,
            Err(CacheError::ShardUnavailable(_))
        ));
        node.set_available(true);
        assert!(node.get("k").await.is_ok());
    }
}
