//! Control plane assembly.
//!
//! `ControlPlane::build` creates every subsystem from a [`FleetConfig`] and
//! a set of [`Collaborators`] (the provisioner, probe, lag introspector,
//! and cache shards the daemon talks to). `spawn_background` then starts:
//! 1. Pool maintenance, which also keeps the health monitor's probe set current
//! 2. The autoscaler tick loop
//! 3. The replica lag refresh loop
//!
//! The front door and REST API are served by the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fleet_core::FleetConfig;
use fleetgrid_admission::{AdmissionRouter, CacheAffinityStore, FrontDoor};
use fleetgrid_api::ApiState;
use fleetgrid_autoscale::Autoscaler;
use fleetgrid_cache::{CacheNode, CacheRouter, MemoryCacheNode};
use fleetgrid_data::{DataRouter, HttpLagIntrospector, LagIntrospector};
use fleetgrid_health::{HealthCheckable, HealthMonitor, HttpReadinessProbe, ProbeSettings};
use fleetgrid_pool::{Provisioner, StaticProvisioner, WorkerPool};
use fleetgrid_state::StateStore;

/// External systems the control plane drives.
pub struct Collaborators {
    pub provisioner: Arc<dyn Provisioner>,
    pub probe: Arc<dyn HealthCheckable>,
    pub introspector: Arc<dyn LagIntrospector>,
    pub cache_nodes: Vec<Arc<dyn CacheNode>>,
}

impl Collaborators {
    /// Production collaborators: static endpoint leasing, HTTP readiness
    /// probes, HTTP lag sidecars, and one in-process node per cache shard.
    pub fn from_config(config: &FleetConfig) -> Self {
        let cache_nodes = config
            .cache
            .shards
            .iter()
            .map(|shard| {
                Arc::new(MemoryCacheNode::new(shard.clone(), config.cache.tombstone_ttl))
                    as Arc<dyn CacheNode>
            })
            .collect();
        Self {
            provisioner: Arc::new(StaticProvisioner::new(config.pool.endpoints.clone())),
            probe: Arc::new(HttpReadinessProbe::new(config.health.endpoint.clone())),
            introspector: Arc::new(HttpLagIntrospector::new(config.health.timeout)),
            cache_nodes,
        }
    }
}

/// Every FleetGrid subsystem, wired together.
pub struct ControlPlane {
    pub config: Arc<FleetConfig>,
    pub store: StateStore,
    pub pool: Arc<WorkerPool>,
    pub monitor: Arc<HealthMonitor>,
    pub admission: Arc<AdmissionRouter>,
    pub data: Arc<DataRouter>,
    /// Present when cache shards are configured.
    pub cache: Option<Arc<CacheRouter>>,
    /// Taken by `spawn_background`.
    autoscaler: Option<Autoscaler>,
}

impl ControlPlane {
    pub fn build(
        config: FleetConfig,
        store: StateStore,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = Arc::new(WorkerPool::new(
            config.pool.clone(),
            collaborators.provisioner,
            store.clone(),
        )?);
        info!(
            min = config.pool.min_instances,
            max = config.pool.max_instances,
            "worker pool initialized"
        );

        let monitor = Arc::new(HealthMonitor::new(
            collaborators.probe,
            pool.clone(),
            ProbeSettings::from(&config.health),
        ));
        info!(
            interval = ?config.health.interval,
            unhealthy_threshold = config.health.unhealthy_threshold,
            healthy_threshold = config.health.healthy_threshold,
            "health monitor initialized"
        );

        let cache = if collaborators.cache_nodes.is_empty() {
            None
        } else {
            let router = CacheRouter::new(config.cache.virtual_nodes, collaborators.cache_nodes);
            info!(shards = router.shard_map().shards.len(), "cache router initialized");
            Some(Arc::new(router))
        };

        let mut admission = AdmissionRouter::new(config.admission.clone(), pool.clone());
        if let Some(cache) = &cache {
            admission = admission.with_affinity(Arc::new(CacheAffinityStore::new(
                Arc::clone(cache),
                config.cache.affinity_ttl,
            )));
        }
        let admission = Arc::new(admission);
        info!(
            ceiling = config.admission.per_instance_in_flight_ceiling,
            queue_depth = config.admission.queue_depth,
            affinity = cache.is_some(),
            "admission router initialized"
        );

        let counters = admission.counters();
        let autoscaler = Autoscaler::new(
            config.autoscale.clone(),
            config.pool.min_instances,
            config.pool.max_instances,
        )
        .with_rejections(Arc::new(move || counters.rejected()));

        let data = Arc::new(DataRouter::new(config.data.clone(), collaborators.introspector));
        info!(
            primary = %config.data.primary,
            replicas = config.data.replicas.len(),
            "data router initialized"
        );

        Ok(Self {
            config,
            store,
            pool,
            monitor,
            admission,
            data,
            cache,
            autoscaler: Some(autoscaler),
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            config: Arc::clone(&self.config),
            store: self.store.clone(),
            pool: Arc::clone(&self.pool),
            admission: self.admission.counters(),
            data: Some(Arc::clone(&self.data)),
            cache: self.cache.clone(),
        }
    }

    pub fn api_router(&self) -> axum::Router {
        fleetgrid_api::build_router(self.api_state())
    }

    pub fn front_door(&self, bind_addr: SocketAddr) -> FrontDoor {
        FrontDoor::new(
            bind_addr,
            Arc::clone(&self.admission),
            self.config.admission.upstream_timeout,
        )
        .with_body_limit(self.config.admission.max_body_bytes)
    }

    /// Start the background loops. Each stops when `shutdown` flips.
    pub fn spawn_background(&mut self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let pool = Arc::clone(&self.pool);
        let monitor = Arc::clone(&self.monitor);
        let maintenance_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            pool.run_maintenance(Some(monitor), maintenance_shutdown).await;
        }));

        match self.autoscaler.take() {
            Some(mut autoscaler) => {
                let pool = Arc::clone(&self.pool);
                let interval = self.config.autoscale.tick_interval;
                let autoscale_shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    autoscaler.run(pool, interval, autoscale_shutdown).await;
                }));
            }
            None => warn!("autoscaler already started"),
        }

        let data = Arc::clone(&self.data);
        handles.push(tokio::spawn(data.run(shutdown)));

        handles
    }

    /// Stop every probe task. Call after the background loops have exited.
    pub async fn stop_probes(&self) {
        self.monitor.stop_all().await;
    }
}
