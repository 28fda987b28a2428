//! fleetd: assembly of the FleetGrid control plane.
//!
//! The binary parses flags and config, then hands off to
//! [`control_plane::ControlPlane`], which wires every subsystem together and
//! owns the background tasks.

pub mod control_plane;

pub use control_plane::{Collaborators, ControlPlane};
