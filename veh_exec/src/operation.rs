//! # Operation
//!
//! The actuation demands are owned by a single [`SharedOperation`]. Each field is stored in its
//! own atomic so that the speed loop and the path follower never tear each other's writes, and
//! write access is split into two channels:
//!
//! - [`SteeringChannel`] - the steering angle, written by the path follower (or manual steering).
//! - [`DriveChannel`] - throttle and foot brake, written by the speed loop and braking calls.
//!
//! Both channels saturate their inputs, so the invariants `throttle ∈ [-1, 1]` and
//! `|steer_angle_rad| <= 35°` hold after any write.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::sync::{
    atomic::{AtomicI32, AtomicU64, Ordering},
    Arc,
};

use comms_if::eqpt::vehicle::Operation;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Maximum magnitude of the steering angle demand (35 degrees).
pub const MAX_STEER_ANGLE_RAD: f64 = 35.0 * std::f64::consts::PI / 180.0;

/// Maximum magnitude of the throttle demand.
pub const MAX_THROTTLE: f64 = 1.0;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// An `f64` which can be shared between threads.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

#[derive(Debug, Default)]
struct OperationCell {
    throttle: AtomicF64,
    foot_brake: AtomicI32,
    steer_angle_rad: AtomicF64,
}

/// Owner of the operation sent to the vehicle.
#[derive(Debug, Clone, Default)]
pub struct SharedOperation {
    cell: Arc<OperationCell>,
}

/// Write access to the steering angle.
#[derive(Debug, Clone)]
pub struct SteeringChannel {
    cell: Arc<OperationCell>,
}

/// Write access to the throttle and foot brake.
#[derive(Debug, Clone)]
pub struct DriveChannel {
    cell: Arc<OperationCell>,
}

/// The target speed of the speed loop, in km/h.
#[derive(Debug, Clone, Default)]
pub struct SpeedDemand {
    target_kmh: Arc<AtomicF64>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst)
    }
}

impl SharedOperation {
    /// Create a new zeroed operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the whole operation.
    ///
    /// Fields are read individually, so a snapshot taken during a write may mix old and new
    /// fields, but never a half-written field.
    pub fn snapshot(&self) -> Operation {
        Operation {
            throttle: self.cell.throttle.load(),
            foot_brake: self.cell.foot_brake.load(Ordering::SeqCst),
            steer_angle_rad: self.cell.steer_angle_rad.load(),
        }
    }

    /// Zero every field.
    pub fn reset(&self) {
        self.cell.throttle.store(0.0);
        self.cell.foot_brake.store(0, Ordering::SeqCst);
        self.cell.steer_angle_rad.store(0.0);
    }

    /// Get a handle for writing the steering angle.
    pub fn steering_channel(&self) -> SteeringChannel {
        SteeringChannel {
            cell: self.cell.clone(),
        }
    }

    /// Get a handle for writing the throttle and brake.
    pub fn drive_channel(&self) -> DriveChannel {
        DriveChannel {
            cell: self.cell.clone(),
        }
    }
}

impl SteeringChannel {
    /// Set the steering angle demand, saturating it to ±35°. Returns the value actually written.
    pub fn set_steer_angle(&self, angle_rad: f64) -> f64 {
        let angle_rad = saturate(angle_rad, MAX_STEER_ANGLE_RAD);
        self.cell.steer_angle_rad.store(angle_rad);
        angle_rad
    }
}

impl DriveChannel {
    /// Set the throttle demand, saturating it to [-1, 1]. Returns the value actually written.
    pub fn set_throttle(&self, throttle: f64) -> f64 {
        let throttle = saturate(throttle, MAX_THROTTLE);
        self.cell.throttle.store(throttle);
        throttle
    }

    pub fn throttle(&self) -> f64 {
        self.cell.throttle.load()
    }

    /// Set the foot brake level. Negative levels are treated as released.
    pub fn set_foot_brake(&self, level: i32) {
        self.cell.foot_brake.store(level.max(0), Ordering::SeqCst)
    }

    pub fn foot_brake(&self) -> i32 {
        self.cell.foot_brake.load(Ordering::SeqCst)
    }
}

impl SpeedDemand {
    pub fn new(target_kmh: f64) -> Self {
        Self {
            target_kmh: Arc::new(AtomicF64::new(target_kmh)),
        }
    }

    pub fn set(&self, target_kmh: f64) {
        self.target_kmh.store(target_kmh)
    }

    pub fn get(&self) -> f64 {
        self.target_kmh.load()
    }

    /// Reverse the direction of the demand, returning the new target.
    pub fn negate(&self) -> f64 {
        let target = -self.get();
        self.set(target);
        target
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Clamp to `[-limit, limit]`, mapping NaN to zero.
fn saturate(value: f64, limit: f64) -> f64 {
    if value.is_nan() {
        0.0
    }
    else {
        value.clamp(-limit, limit)
    }
}
