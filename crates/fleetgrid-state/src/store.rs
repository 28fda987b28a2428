//! StateStore: Redb-backed persistence for FleetGrid.
//!
//! Stores the pool checkpoint (last published snapshot version) and the
//! last applied scaling decision, plus a bounded decision history. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Maximum number of decisions kept in the history table.
pub const DECISION_HISTORY_LIMIT: usize = 256;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(POOL).map_err(map_err!(Table))?;
        txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        txn.open_table(DECISION_LOG).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Pool checkpoint ────────────────────────────────────────────

    /// Record the latest published snapshot version.
    pub fn put_checkpoint(&self, checkpoint: &PoolCheckpoint) -> StateResult<()> {
        let value = serde_json::to_vec(checkpoint).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POOL).map_err(map_err!(Table))?;
            table
                .insert(CHECKPOINT_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(version = checkpoint.snapshot_version, "pool checkpoint stored");
        Ok(())
    }

    /// Read the last persisted pool checkpoint, if any.
    pub fn get_checkpoint(&self) -> StateResult<Option<PoolCheckpoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POOL).map_err(map_err!(Table))?;
        match table.get(CHECKPOINT_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let checkpoint: PoolCheckpoint =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    // ── Scaling decisions ──────────────────────────────────────────

    /// Record a decision as the last applied one and append it to the history.
    ///
    /// History beyond [`DECISION_HISTORY_LIMIT`] entries is pruned oldest-first
    /// in the same transaction.
    pub fn put_applied_decision(&self, decision: &ScalingDecision) -> StateResult<()> {
        let value = serde_json::to_vec(decision).map_err(map_err!(Serialize))?;
        let log_key = decision.log_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
            table
                .insert(LAST_APPLIED_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        {
            let mut log = txn.open_table(DECISION_LOG).map_err(map_err!(Table))?;
            log.insert(log_key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let keys: Vec<String> = log
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    Some(key.value().to_string())
                })
                .collect();
            if keys.len() > DECISION_HISTORY_LIMIT {
                let excess = keys.len() - DECISION_HISTORY_LIMIT;
                for key in &keys[..excess] {
                    log.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            target = decision.target,
            reason = %decision.reason,
            decided_at = decision.decided_at,
            "applied decision stored"
        );
        Ok(())
    }

    /// Read the last applied decision, if any.
    pub fn last_applied_decision(&self) -> StateResult<Option<ScalingDecision>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        match table.get(LAST_APPLIED_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let decision: ScalingDecision =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(decision))
            }
            None => Ok(None),
        }
    }

    /// List applied decisions, most recent first.
    pub fn list_decisions(&self, limit: usize) -> StateResult<Vec<ScalingDecision>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISION_LOG).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let decision: ScalingDecision =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(decision);
        }
        Ok(results)
    }
}
