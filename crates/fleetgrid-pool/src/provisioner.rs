//! Capacity provisioning contract.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};

use fleetgrid_state::InstanceId;

use crate::error::{PoolError, PoolResult};

/// Creates and destroys worker capacity.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start a worker for `id` and return its endpoint (ip:port).
    async fn provision(&self, id: &str) -> PoolResult<String>;

    /// Tear down the worker previously provisioned for `id`.
    async fn terminate(&self, id: &str, endpoint: &str) -> PoolResult<()>;
}

/// Leases endpoints from a fixed list of pre-provisioned hosts.
pub struct StaticProvisioner {
    endpoints: Vec<String>,
    /// endpoint → instance currently holding it.
    leases: Mutex<HashMap<String, InstanceId>>,
}

impl StaticProvisioner {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn available(&self) -> usize {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        self.endpoints.len() - leases.len()
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn provision(&self, id: &str) -> PoolResult<String> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let free = self
            .endpoints
            .iter()
            .find(|ep| !leases.contains_key(*ep))
            .cloned()
            .ok_or_else(|| {
                PoolError::Provision(format!(
                    "all {} static endpoints are leased",
                    self.endpoints.len()
                ))
            })?;
        leases.insert(free.clone(), id.to_string());
        info!(instance_id = %id, endpoint = %free, "leased static endpoint");
        Ok(free)
    }

    async fn terminate(&self, id: &str, endpoint: &str) -> PoolResult<()> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(endpoint) {
            Some(holder) if holder == id => {
                leases.remove(endpoint);
                debug!(instance_id = %id, %endpoint, "released static endpoint");
                Ok(())
            }
            _ => Err(PoolError::Terminate(format!(
                "endpoint {endpoint} is not leased to {id}"
            ))),
        }
    }
}
