//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fleet_core::FleetConfig;
use fleetd::{Collaborators, ControlPlane};
use fleetgrid_cache::{CacheNode, MemoryCacheNode};
use fleetgrid_data::{DataError, DataResult, LagIntrospector};
use fleetgrid_health::{HealthCheckable, ProbeResult};
use fleetgrid_pool::{PoolResult, Provisioner};
use fleetgrid_state::StateStore;

/// Hands out `fake-N:80` endpoints and remembers terminations.
#[derive(Default)]
pub struct FakeProvisioner {
    next: AtomicU64,
    pub terminated: Mutex<Vec<String>>,
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(&self, _id: &str) -> PoolResult<String> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(format!("fake-{n}:80"))
    }

    async fn terminate(&self, id: &str, _endpoint: &str) -> PoolResult<()> {
        self.terminated.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

/// Every endpoint is ready at a shared load unless overridden.
pub struct ScriptedProbe {
    load_bits: AtomicU64,
    overrides: Mutex<HashMap<String, ProbeResult>>,
}

impl ScriptedProbe {
    pub fn new(load: f64) -> Self {
        Self {
            load_bits: AtomicU64::new(load.to_bits()),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_load(&self, load: f64) {
        self.load_bits.store(load.to_bits(), Ordering::SeqCst);
    }

    pub fn set(&self, endpoint: &str, result: ProbeResult) {
        self.overrides
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), result);
    }
}

#[async_trait]
impl HealthCheckable for ScriptedProbe {
    async fn probe(&self, endpoint: &str) -> ProbeResult {
        if let Some(result) = self.overrides.lock().unwrap().get(endpoint) {
            return *result;
        }
        ProbeResult::Ready {
            load: f64::from_bits(self.load_bits.load(Ordering::SeqCst)),
        }
    }
}

/// Fixed lag per replica; unknown replicas are unreachable.
#[derive(Default)]
pub struct FixedLag {
    pub lags: HashMap<String, Duration>,
}

#[async_trait]
impl LagIntrospector for FixedLag {
    async fn replica_lag(&self, replica: &str) -> DataResult<Duration> {
        self.lags
            .get(replica)
            .copied()
            .ok_or_else(|| DataError::ReplicaUnreachable(replica.to_string()))
    }

    async fn ping_primary(&self, _primary: &str) -> DataResult<()> {
        Ok(())
    }
}

/// Config with short intervals so loops converge within a test.
pub fn fast_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.pool.min_instances = 2;
    config.pool.max_instances = 3;
    config.pool.maintenance_interval = Duration::from_millis(10);
    config.health.interval = Duration::from_millis(20);
    config.health.timeout = Duration::from_millis(10);
    config.health.unhealthy_threshold = 2;
    config.health.healthy_threshold = 2;
    config.autoscale.tick_interval = Duration::from_millis(30);
    config.data.primary = "10.0.1.1:5432".to_string();
    config.data.replicas = vec!["10.0.1.2:5432".to_string(), "10.0.1.3:5432".to_string()];
    config.data.lag_refresh_interval = Duration::from_millis(20);
    config.cache.shards = vec!["10.0.2.1:6379".to_string(), "10.0.2.2:6379".to_string()];
    config
}

pub struct Harness {
    pub plane: ControlPlane,
    pub provisioner: Arc<FakeProvisioner>,
    pub probe: Arc<ScriptedProbe>,
}

pub fn harness(config: FleetConfig, store: StateStore, load: f64) -> Harness {
    let provisioner = Arc::new(FakeProvisioner::default());
    let probe = Arc::new(ScriptedProbe::new(load));
    let lags = HashMap::from([
        ("10.0.1.2:5432".to_string(), Duration::from_millis(3_000)),
        ("10.0.1.3:5432".to_string(), Duration::from_millis(150)),
    ]);
    let cache_nodes = config
        .cache
        .shards
        .iter()
        .map(|s| Arc::new(MemoryCacheNode::new(s.clone(), Duration::from_secs(60))) as Arc<dyn CacheNode>)
        .collect();
    let collaborators = Collaborators {
        provisioner: provisioner.clone(),
        probe: probe.clone(),
        introspector: Arc::new(FixedLag { lags }),
        cache_nodes,
    };
    let plane = ControlPlane::build(config, store, collaborators).unwrap();
    Harness {
        plane,
        provisioner,
        probe,
    }
}

/// Poll `cond` every 10ms for up to 3s.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
