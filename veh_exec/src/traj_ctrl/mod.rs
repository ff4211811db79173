//! # Trajectory control module
//!
//! Trajectory control keeps the vehicle on the active path. Control is split into epochs, one per
//! path of the route. Each tick of an epoch:
//!
//! 1. The steering model is updated with the latest path errors, steering angle, speed and the
//!    curvature of the path at the current waypoint.
//! 2. The predictive functional control law ([`pfc`]) builds a reference point which the vehicle
//!    should reach after `i` ticks, by interpolating a cubic Bezier curve between the vehicle and
//!    a lookahead point on the path.
//! 3. The steering controller ([`controllers`]) turns the reference into a steering angle demand.
//!
//! Paths driven in reverse (`Back` paths) are wrapped in a braking handshake and run the same law
//! in a frame rotated by half a turn, see [`epoch`].

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod controllers;
pub mod epoch;
pub mod pfc;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

use crate::info_stream::WaitError;

pub use controllers::*;
pub use epoch::*;
pub use pfc::*;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for trajectory control, loaded from `traj_ctrl.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajCtrlParams {
    /// Time in which the vehicle should converge onto the path
    pub convergence_time_s: f64,

    /// Sharpness of the reference curve. Larger values give longer control arms to the Bezier
    /// curve, so the reference leaves the vehicle and joins the path more tangentially.
    pub sharpness: f64,

    /// Limit on the pursuit angle towards the reference point
    pub far_angle_rad: f64,

    /// Limit on the curvature feed-forward steering angle
    pub near_angle_rad: f64,

    /// Reference points closer than this are followed on curvature alone
    pub min_pursuit_distance_m: f64,

    /// Speed above which the vehicle is considered to be moving
    pub motion_threshold_kmh: f64,

    /// Foot brake level used in the reverse handshake
    pub brake_level: i32,

    /// How long the brake is held in the reverse handshake
    pub brake_hold_ms: u64,

    /// The steering controller to use
    pub controller: SteeringControllerParams,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TrajCtrlError {
    #[error("Wait interrupted: {0}")]
    Wait(#[from] WaitError),

    #[error("The navigator lock is poisoned")]
    PoisonError,

    #[error("The navigator has no active path")]
    NoActivePath,

    #[error("The navigator could not provide a lookahead point")]
    NoLookAhead,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for TrajCtrlParams {
    fn default() -> Self {
        Self {
            convergence_time_s: 1.5,
            sharpness: 1.0,
            far_angle_rad: 35f64.to_radians(),
            near_angle_rad: 10f64.to_radians(),
            min_pursuit_distance_m: 0.05,
            motion_threshold_kmh: 0.1,
            brake_level: 2,
            brake_hold_ms: 200,
            controller: SteeringControllerParams::Pfc,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TrajCtrlError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        TrajCtrlError::PoisonError
    }
}
