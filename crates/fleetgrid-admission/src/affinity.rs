//! Session → instance affinity records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use fleetgrid_cache::CacheRouter;
use fleetgrid_state::InstanceId;

use crate::error::{AdmissionError, AdmissionResult};

/// Where session pins are kept.
///
/// Callers treat every error as a miss; a broken store degrades affinity,
/// never admission.
#[async_trait]
pub trait AffinityStore: Send + Sync {
    async fn lookup(&self, session: &str) -> AdmissionResult<Option<InstanceId>>;

    async fn record(&self, session: &str, instance: &str) -> AdmissionResult<()>;
}

/// Affinity kept in the shared cache cluster under `affinity:{session}`.
pub struct CacheAffinityStore {
    cache: Arc<CacheRouter>,
    ttl: Duration,
}

impl CacheAffinityStore {
    pub fn new(cache: Arc<CacheRouter>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    fn key(session: &str) -> String {
        format!("affinity:{session}")
    }
}

#[async_trait]
impl AffinityStore for CacheAffinityStore {
    async fn lookup(&self, session: &str) -> AdmissionResult<Option<InstanceId>> {
        let value = self
            .cache
            .get(&Self::key(session))
            .await
            .map_err(|e| AdmissionError::Affinity(e.to_string()))?;
        Ok(value.and_then(|bytes| String::from_utf8(bytes.to_vec()).ok()))
    }

    async fn record(&self, session: &str, instance: &str) -> AdmissionResult<()> {
        self.cache
            .set(
                &Self::key(session),
                Bytes::copy_from_slice(instance.as_bytes()),
                Some(self.ttl),
            )
            .await
            .map(|_| ())
            .map_err(|e| AdmissionError::Affinity(e.to_string()))
    }
}
