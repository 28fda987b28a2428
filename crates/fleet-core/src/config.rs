//! fleet.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::{ConfigError, ConfigResult};

/// Top-level control plane configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub pool: PoolSettings,
    pub autoscale: AutoscaleSettings,
    pub health: HealthSettings,
    pub admission: AdmissionSettings,
    pub data: DataSettings,
    pub cache: CacheSettings,
    pub state: StateSettings,
}

/// Worker pool sizing and lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_instances: u32,
    pub max_instances: u32,
    /// Upper bound on how long a draining instance may keep in-flight work.
    #[serde(with = "serde_str")]
    pub drain_deadline: Duration,
    /// An instance that is not Ready within this window is discarded.
    #[serde(with = "serde_str")]
    pub provisioning_timeout: Duration,
    /// A Ready instance unhealthy for this long is drained and replaced.
    #[serde(with = "serde_str")]
    pub unhealthy_replace_after: Duration,
    /// Consecutive provisioning failures before replacement stops.
    pub max_provision_attempts: u32,
    #[serde(with = "serde_str")]
    pub maintenance_interval: Duration,
    /// Pre-provisioned worker endpoints (ip:port) leased by the static provisioner.
    pub endpoints: Vec<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 10,
            drain_deadline: Duration::from_secs(30),
            provisioning_timeout: Duration::from_secs(120),
            unhealthy_replace_after: Duration::from_secs(120),
            max_provision_attempts: 3,
            maintenance_interval: Duration::from_secs(1),
            endpoints: Vec::new(),
        }
    }
}

/// Autoscaler targets and hysteresis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleSettings {
    /// Utilization each instance should run at (0.0, 1.0].
    pub target_utilization: f64,
    #[serde(with = "serde_str")]
    pub scale_down_cooldown: Duration,
    #[serde(with = "serde_str")]
    pub tick_interval: Duration,
    /// Load samples older than this are ignored.
    #[serde(with = "serde_str")]
    pub metrics_max_age: Duration,
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            target_utilization: 0.7,
            scale_down_cooldown: Duration::from_secs(300),
            tick_interval: Duration::from_secs(30),
            metrics_max_age: Duration::from_secs(30),
        }
    }
}

/// Health probe parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// HTTP path of the worker readiness endpoint.
    pub endpoint: String,
    #[serde(with = "serde_str")]
    pub interval: Duration,
    #[serde(with = "serde_str")]
    pub timeout: Duration,
    /// Consecutive failures before an instance is unhealthy (K).
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an unhealthy instance recovers (M).
    pub healthy_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            endpoint: "/ready".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Front-door admission and backpressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSettings {
    pub per_instance_in_flight_ceiling: u32,
    /// Requests allowed to wait for capacity. Zero means fail fast.
    pub queue_depth: u32,
    #[serde(with = "serde_str")]
    pub queue_timeout: Duration,
    /// Bound on a forwarded request, connect to last response byte.
    #[serde(with = "serde_str")]
    pub upstream_timeout: Duration,
    /// Cap on a buffered request or response body.
    pub max_body_bytes: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            per_instance_in_flight_ceiling: 64,
            queue_depth: 0,
            queue_timeout: Duration::from_millis(250),
            upstream_timeout: Duration::from_secs(30),
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Primary/replica topology and read routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub primary: String,
    pub replicas: Vec<String>,
    #[serde(with = "serde_str")]
    pub max_allowed_replica_lag: Duration,
    #[serde(with = "serde_str")]
    pub lag_refresh_interval: Duration,
    /// Reads in a session that wrote within this window go to the primary.
    #[serde(with = "serde_str")]
    pub read_your_writes_window: Duration,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            primary: "127.0.0.1:5432".to_string(),
            replicas: Vec::new(),
            max_allowed_replica_lag: Duration::from_secs(2),
            lag_refresh_interval: Duration::from_secs(5),
            read_your_writes_window: Duration::from_secs(5),
        }
    }
}

/// Cache cluster sharding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub shards: Vec<String>,
    pub virtual_nodes: u32,
    #[serde(with = "serde_str")]
    pub tombstone_ttl: Duration,
    /// TTL applied to recorded session affinities.
    #[serde(with = "serde_str")]
    pub affinity_ttl: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            shards: Vec::new(),
            virtual_nodes: 128,
            tombstone_ttl: Duration::from_secs(60),
            affinity_ttl: Duration::from_secs(1800),
        }
    }
}

/// Durable control plane state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    pub data_dir: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        let pool = &self.pool;
        if pool.max_instances == 0 {
            return Err(invalid("pool.max_instances must be at least 1"));
        }
        if pool.min_instances > pool.max_instances {
            return Err(invalid(format!(
                "pool.min_instances ({}) exceeds pool.max_instances ({})",
                pool.min_instances, pool.max_instances
            )));
        }
        if pool.maintenance_interval.is_zero() {
            return Err(invalid("pool.maintenance_interval must be non-zero"));
        }

        let target = self.autoscale.target_utilization;
        if !(target > 0.0 && target <= 1.0) {
            return Err(invalid(format!(
                "autoscale.target_utilization must be in (0, 1], got {target}"
            )));
        }
        if self.autoscale.tick_interval.is_zero() {
            return Err(invalid("autoscale.tick_interval must be non-zero"));
        }

        let health = &self.health;
        if health.unhealthy_threshold == 0 || health.healthy_threshold == 0 {
            return Err(invalid("health thresholds must be at least 1"));
        }
        if health.timeout >= health.interval {
            return Err(invalid(format!(
                "health.timeout ({:?}) must be shorter than health.interval ({:?})",
                health.timeout, health.interval
            )));
        }
        if !health.endpoint.starts_with('/') {
            return Err(invalid("health.endpoint must be an absolute path"));
        }

        if self.admission.per_instance_in_flight_ceiling == 0 {
            return Err(invalid("admission.per_instance_in_flight_ceiling must be at least 1"));
        }
        if self.admission.upstream_timeout.is_zero() {
            return Err(invalid("admission.upstream_timeout must be non-zero"));
        }
        if self.admission.max_body_bytes == 0 {
            return Err(invalid("admission.max_body_bytes must be at least 1"));
        }
        if self.data.lag_refresh_interval.is_zero() {
            return Err(invalid("data.lag_refresh_interval must be non-zero"));
        }
        if self.cache.virtual_nodes == 0 {
            return Err(invalid("cache.virtual_nodes must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
