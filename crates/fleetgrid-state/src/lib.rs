//! fleetgrid-state: durable state and shared domain types for FleetGrid.
//!
//! Only two things must survive a control plane restart: the last published
//! pool snapshot version and the last applied scaling decision. Everything
//! else is re-derived from live probes. Both are stored in a
//! [redb](https://docs.rs/redb) database as JSON values, alongside a bounded
//! history of applied decisions for the status API.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
