//! fleetgrid-autoscale: sizes the worker pool from aggregate utilization.
//!
//! Scale-up is immediate; scale-down waits until the desired count has
//! stayed below the ready count for a full cooldown window.

pub mod scaler;

pub use scaler::{Autoscaler, RejectionCounter, ScalingInput};
