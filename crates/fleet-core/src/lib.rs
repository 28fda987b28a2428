//! fleet-core: configuration for the FleetGrid control plane.
//!
//! `fleet.toml` is parsed into [`FleetConfig`]. Every section is optional;
//! missing sections and fields fall back to the defaults documented on each
//! struct. Durations are written as strings (`"500ms"`, `"30s"`, `"5m"`).

pub mod config;
pub mod duration;
pub mod error;

pub use config::{
    AdmissionSettings, AutoscaleSettings, CacheSettings, DataSettings, FleetConfig,
    HealthSettings, PoolSettings, StateSettings,
};
pub use duration::{format_duration, parse_duration};
pub use error::{ConfigError, ConfigResult};
