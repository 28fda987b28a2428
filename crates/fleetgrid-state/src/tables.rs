//! redb table definitions for the FleetGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Pool bookkeeping keyed by a fixed name (`checkpoint`).
pub const POOL: TableDefinition<&str, &[u8]> = TableDefinition::new("pool");

/// The last applied scaling decision keyed by `last_applied`.
pub const DECISIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decisions");

/// Applied decision history keyed by zero-padded `decided_at` millis.
pub const DECISION_LOG: TableDefinition<&str, &[u8]> = TableDefinition::new("decision_log");

pub const CHECKPOINT_KEY: &str = "checkpoint";
pub const LAST_APPLIED_KEY: &str = "last_applied";
