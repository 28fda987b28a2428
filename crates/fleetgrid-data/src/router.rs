//! DataRouter: picks primary or replica per query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use fleet_core::DataSettings;
use fleetgrid_state::epoch_millis;

use crate::error::{DataError, DataResult};
use crate::introspect::LagIntrospector;

/// Estimates older than this many refresh intervals are ignored.
const STALE_AFTER_INTERVALS: u32 = 3;

/// How fresh a read must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConsistency {
    /// Any sufficiently fresh replica will do.
    Eventual,
    /// Must observe the session's own recent writes.
    Session,
    /// Must observe every committed write.
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Write,
    Read(ReadConsistency),
}

/// Routing input for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub kind: QueryKind,
    pub session: Option<String>,
}

impl Query {
    pub fn write(session: Option<&str>) -> Self {
        Self {
            kind: QueryKind::Write,
            session: session.map(str::to_string),
        }
    }

    pub fn read(consistency: ReadConsistency, session: Option<&str>) -> Self {
        Self {
            kind: QueryKind::Read(consistency),
            session: session.map(str::to_string),
        }
    }
}

/// Where a query should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Primary(String),
    Replica(String),
}

impl Route {
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Primary(ep) | Self::Replica(ep) => ep,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary(_))
    }
}

/// Latest lag measurement for one replica.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaLagEstimate {
    pub replica: String,
    /// `None` until a measurement succeeds.
    pub lag: Option<Duration>,
    /// Unix millis of the last refresh attempt.
    pub measured_at: u64,
    pub reachable: bool,
}

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub primary_reachable: bool,
    pub measured: usize,
    pub unreachable: Vec<String>,
    pub sessions_pruned: usize,
}

/// Routes queries between the primary and its replicas.
pub struct DataRouter {
    settings: DataSettings,
    introspector: Arc<dyn LagIntrospector>,
    lag: RwLock<HashMap<String, ReplicaLagEstimate>>,
    primary_up: AtomicBool,
    /// session → Unix millis of its last write.
    sessions: Mutex<HashMap<String, u64>>,
}

impl DataRouter {
    /// The primary is assumed reachable and replicas unmeasured until the
    /// first refresh.
    pub fn new(settings: DataSettings, introspector: Arc<dyn LagIntrospector>) -> Self {
        Self {
            settings,
            introspector,
            lag: RwLock::new(HashMap::new()),
            primary_up: AtomicBool::new(true),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn route(&self, query: &Query) -> DataResult<Route> {
        self.route_at(query, epoch_millis())
    }

    /// Route `query` as of `now` (Unix millis).
    pub fn route_at(&self, query: &Query, now: u64) -> DataResult<Route> {
        match query.kind {
            QueryKind::Write => {
                let route = self.primary()?;
                if let Some(session) = &query.session {
                    self.lock_sessions().insert(session.clone(), now);
                }
                Ok(route)
            }
            QueryKind::Read(ReadConsistency::Strong) => self.primary(),
            QueryKind::Read(ReadConsistency::Session) if self.wrote_recently(query, now) => {
                self.primary()
            }
            QueryKind::Read(_) => match self.best_replica(now) {
                Some(replica) => Ok(Route::Replica(replica)),
                None => {
                    debug!("no eligible replica; reading from primary");
                    self.primary()
                }
            },
        }
    }

    fn primary(&self) -> DataResult<Route> {
        if self.primary_up.load(Ordering::Acquire) {
            Ok(Route::Primary(self.settings.primary.clone()))
        } else {
            Err(DataError::PrimaryUnreachable(self.settings.primary.clone()))
        }
    }

    fn wrote_recently(&self, query: &Query, now: u64) -> bool {
        let Some(session) = &query.session else {
            return false;
        };
        let window = millis(self.settings.read_your_writes_window);
        self.lock_sessions()
            .get(session)
            .is_some_and(|at| now.saturating_sub(*at) <= window)
    }

    /// Least-lagged replica that is reachable, freshly measured, and under
    /// the lag bound. Ties go to the lower address.
    fn best_replica(&self, now: u64) -> Option<String> {
        let stale_after = millis(self.settings.lag_refresh_interval) * u64::from(STALE_AFTER_INTERVALS);
        let lag = self.lag.read().unwrap_or_else(|e| e.into_inner());
        lag.values()
            .filter(|e| e.reachable && now.saturating_sub(e.measured_at) <= stale_after)
            .filter_map(|e| Some((e.lag?, e)))
            .filter(|(lag, _)| *lag < self.settings.max_allowed_replica_lag)
            .min_by(|(a, ea), (b, eb)| a.cmp(b).then_with(|| ea.replica.cmp(&eb.replica)))
            .map(|(_, e)| e.replica.clone())
    }

    pub fn primary_reachable(&self) -> bool {
        self.primary_up.load(Ordering::Acquire)
    }

    /// Current lag table, sorted by replica.
    pub fn lag_table(&self) -> Vec<ReplicaLagEstimate> {
        let lag = self.lag.read().unwrap_or_else(|e| e.into_inner());
        let mut table: Vec<ReplicaLagEstimate> = lag.values().cloned().collect();
        table.sort_by(|a, b| a.replica.cmp(&b.replica));
        table
    }

    pub fn settings(&self) -> &DataSettings {
        &self.settings
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Measure every replica concurrently, ping the primary, and prune
    /// session write records older than the read-your-writes window.
    pub async fn refresh_lag(&self) -> RefreshReport {
        let mut probes = JoinSet::new();
        for replica in &self.settings.replicas {
            let introspector = Arc::clone(&self.introspector);
            let replica = replica.clone();
            probes.spawn(async move {
                let result = introspector.replica_lag(&replica).await;
                (replica, result)
            });
        }

        let primary_result = self.introspector.ping_primary(&self.settings.primary).await;
        let primary_reachable = primary_result.is_ok();
        let was_up = self.primary_up.swap(primary_reachable, Ordering::AcqRel);
        match (&primary_result, was_up) {
            (Err(e), true) => warn!(primary = %self.settings.primary, error = %e, "primary unreachable"),
            (Ok(()), false) => info!(primary = %self.settings.primary, "primary reachable again"),
            _ => {}
        }

        let mut report = RefreshReport {
            primary_reachable,
            ..RefreshReport::default()
        };
        let mut measurements = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(measurement) => measurements.push(measurement),
                Err(e) => warn!(error = %e, "lag probe task failed"),
            }
        }

        let now = epoch_millis();
        {
            let mut lag = self.lag.write().unwrap_or_else(|e| e.into_inner());
            for (replica, result) in measurements {
                let entry = lag.entry(replica.clone()).or_insert_with(|| ReplicaLagEstimate {
                    replica: replica.clone(),
                    lag: None,
                    measured_at: now,
                    reachable: false,
                });
                entry.measured_at = now;
                match result {
                    Ok(measured) => {
                        entry.lag = Some(measured);
                        entry.reachable = true;
                        report.measured += 1;
                        if measured >= self.settings.max_allowed_replica_lag {
                            debug!(%replica, lag = ?measured, "replica over lag bound");
                        }
                    }
                    Err(e) => {
                        let err = match e {
                            unreachable @ DataError::ReplicaUnreachable(_) => unreachable,
                            other => DataError::ReplicaUnreachable(format!("{replica}: {other}")),
                        };
                        warn!(%replica, error = %err, "replica excluded from reads");
                        entry.reachable = false;
                        report.unreachable.push(replica);
                    }
                }
            }
            // Replicas dropped from configuration leave the table.
            lag.retain(|replica, _| self.settings.replicas.contains(replica));
        }

        let window = millis(self.settings.read_your_writes_window);
        let mut sessions = self.lock_sessions();
        let before = sessions.len();
        sessions.retain(|_, at| now.saturating_sub(*at) <= window);
        report.sessions_pruned = before - sessions.len();

        report
    }

    /// Refresh on the configured interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.lag_refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            replicas = self.settings.replicas.len(),
            interval = ?self.settings.lag_refresh_interval,
            "replica lag refresh started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.refresh_lag().await;
                    debug!(
                        measured = report.measured,
                        unreachable = report.unreachable.len(),
                        primary = report.primary_reachable,
                        "replica lag refreshed"
                    );
                }
                _ = shutdown.changed() => {
                    info!("replica lag refresh shutting down");
                    break;
                }
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Introspector backed by a table the test controls.
    #[derive(Default)]
    struct FakeIntrospector {
        lags: Mutex<HashMap<String, Option<Duration>>>,
        primary_down: AtomicBool,
    }

    impl FakeIntrospector {
        fn set(&self, replica: &str, lag: Option<Duration>) {
            self.lags.lock().unwrap().insert(replica.to_string(), lag);
        }
    }

    #[async_trait]
    impl LagIntrospector for FakeIntrospector {
        async fn replica_lag(&self, replica: &str) -> DataResult<Duration> {
            self.lags
                .lock()
                .unwrap()
                .get(replica)
                .copied()
                .flatten()
                .ok_or_else(|| DataError::ReplicaUnreachable(replica.to_string()))
        }

        async fn ping_primary(&self, primary: &str) -> DataResult<()> {
            if self.primary_down.load(Ordering::SeqCst) {
                Err(DataError::PrimaryUnreachable(primary.to_string()))
            } else {
                Ok(())
            }
        }
    }

    const PRIMARY: &str = "10.0.1.1:5432";
    const A: &str = "10.0.1.2:5432";
    const B: &str = "10.0.1.3:5432";

    fn settings() -> DataSettings {
        DataSettings {
            primary: PRIMARY.to_string(),
            replicas: vec![A.to_string(), B.to_string()],
            ..DataSettings::default()
        }
    }

    fn router(lag_a: Option<u64>, lag_b: Option<u64>) -> (DataRouter, Arc<FakeIntrospector>) {
        let introspector = Arc::new(FakeIntrospector::default());
        introspector.set(A, lag_a.map(Duration::from_millis));
        introspector.set(B, lag_b.map(Duration::from_millis));
        (DataRouter::new(settings(), introspector.clone()), introspector)
    }

    fn eventual() -> Query {
        Query::read(ReadConsistency::Eventual, None)
    }

    #[tokio::test]
    async fn unmeasured_replicas_fall_back_to_primary() {
        let (router, _) = router(Some(10), Some(10));
        assert_eq!(router.route(&eventual()).unwrap(), Route::Primary(PRIMARY.into()));
    }

    #[tokio::test]
    async fn eventual_read_picks_least_lagged_replica() {
        let (router, _) = router(Some(400), Some(100));
        router.refresh_lag().await;
        assert_eq!(router.route(&eventual()).unwrap(), Route::Replica(B.into()));
    }

    #[tokio::test]
    async fn replica_over_lag_bound_is_skipped() {
        let (router, _) = router(Some(2_500), Some(1_200));
        router.refresh_lag().await;
        assert_eq!(router.route(&eventual()).unwrap(), Route::Replica(B.into()));

        // Lag exactly at the bound is not eligible either.
        let (router, _) = router_with_exact_bound();
        router.refresh_lag().await;
        assert_eq!(router.route(&eventual()).unwrap(), Route::Primary(PRIMARY.into()));
    }

    fn router_with_exact_bound() -> (DataRouter, Arc<FakeIntrospector>) {
        router(Some(2_000), None)
    }

    #[tokio::test]
    async fn unreachable_replica_is_excluded() {
        let (router, introspector) = router(Some(100), Some(300));
        router.refresh_lag().await;
        assert_eq!(router.route(&eventual()).unwrap(), Route::Replica(A.into()));

        introspector.set(A, None);
        let report = router.refresh_lag().await;
        assert_eq!(report.unreachable, vec![A.to_string()]);
        assert_eq!(router.route(&eventual()).unwrap(), Route::Replica(B.into()));

        let table = router.lag_table();
        assert_eq!(table.len(), 2);
        assert!(!table[0].reachable);
    }

    #[tokio::test]
    async fn stale_estimates_are_ignored() {
        let (router, _) = router(Some(100), Some(100));
        router.refresh_lag().await;
        let now = epoch_millis();
        // Default refresh interval is 5s; 3 intervals later the table is stale.
        assert!(!router.route_at(&eventual(), now).unwrap().is_primary());
        assert!(router.route_at(&eventual(), now + 16_000).unwrap().is_primary());
    }

    #[tokio::test]
    async fn consistency_sensitive_reads_never_hit_replicas() {
        let (router, _) = router(Some(0), Some(0));
        router.refresh_lag().await;
        let now = epoch_millis();

        let strong = Query::read(ReadConsistency::Strong, Some("s1"));
        assert!(router.route_at(&strong, now).unwrap().is_primary());

        router.route_at(&Query::write(Some("s1")), now).unwrap();
        let session = Query::read(ReadConsistency::Session, Some("s1"));
        for offset in [0, 1_000, 4_999, 5_000] {
            assert!(router.route_at(&session, now + offset).unwrap().is_primary());
        }
        // Outside the window the session may read from a replica.
        assert!(!router.route_at(&session, now + 5_001).unwrap().is_primary());

        // Other sessions are unaffected.
        let other = Query::read(ReadConsistency::Session, Some("s2"));
        assert!(!router.route_at(&other, now).unwrap().is_primary());
    }

    #[tokio::test]
    async fn writes_fail_when_primary_is_down() {
        let (router, introspector) = router(Some(10), Some(10));
        introspector.primary_down.store(true, Ordering::SeqCst);
        let report = router.refresh_lag().await;
        assert!(!report.primary_reachable);
        assert!(!router.primary_reachable());

        assert!(matches!(
            router.route(&Query::write(Some("s1"))),
            Err(DataError::PrimaryUnreachable(_))
        ));
        assert!(matches!(
            router.route(&Query::read(ReadConsistency::Strong, None)),
            Err(DataError::PrimaryUnreachable(_))
        ));
        // Eventual reads still have replicas.
        assert_eq!(router.route(&eventual()).unwrap(), Route::Replica(A.into()));

        introspector.primary_down.store(false, Ordering::SeqCst);
        router.refresh_lag().await;
        assert!(router.route(&Query::write(None)).unwrap().is_primary());
    }

    #[tokio::test]
    async fn refresh_prunes_expired_sessions() {
        let (router, _) = router(Some(10), Some(10));
        let long_ago = epoch_millis() - 60_000;
        router.route_at(&Query::write(Some("old")), long_ago).unwrap();
        router.route(&Query::write(Some("new"))).unwrap();

        let report = router.refresh_lag().await;
        assert_eq!(report.sessions_pruned, 1);
        assert_eq!(report.measured, 2);
    }

    #[tokio::test]
    async fn run_loop_refreshes_until_shutdown() {
        let (router, _) = router(Some(10), Some(20));
        let router = Arc::new(router);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&router).run(rx));

        for _ in 0..100 {
            if router.lag_table().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(router.lag_table().len(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
