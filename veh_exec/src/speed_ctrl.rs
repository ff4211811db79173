//! # Speed control
//!
//! The speed loop subscribes to the information stream and, for every state with path errors
//! while the foot brake is released, corrects the throttle with a PID controller acting on the
//! speed error:
//!
//! ```text
//! speed_error = speed - target
//! throttle    = clamp(throttle - pid(speed_error), -1, 1)
//! ```
//!
//! The controller is incremental, its output is accumulated into the throttle. While the brake is
//! applied the loop does nothing and the controller's memory is cleared, so that releasing the
//! brake does not produce a derivative kick.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, trace};
use serde::{Deserialize, Serialize};
use util::{cancel::CancelToken, time::duration_to_seconds};

use crate::{
    info_stream::{CompositeState, Subscription, WaitError},
    operation::{DriveChannel, SpeedDemand},
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Speed control parameters, loaded from `speed_ctrl.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedCtrlParams {
    /// Proportional gain
    pub k_p: f64,

    /// Integral gain
    pub k_i: f64,

    /// Derivative gain
    pub k_d: f64,
}

/// A PID controller
#[derive(Debug, Serialize, Clone)]
pub struct PidController {
    /// Proportional gain
    k_p: f64,

    /// Integral gain
    k_i: f64,

    /// Dervative gain
    k_d: f64,

    /// Previous error
    prev_error: Option<f64>,

    /// The integral accumulation
    integral: f64,
}

/// The speed loop.
pub struct SpeedController {
    pid: PidController,
    drive: DriveChannel,
    demand: SpeedDemand,
    prev_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for SpeedCtrlParams {
    fn default() -> Self {
        Self {
            k_p: 0.001,
            k_i: 0.0,
            k_d: 0.003,
        }
    }
}

impl PidController {
    /// Create a new controller with the given gains.
    pub fn new(k_p: f64, k_i: f64, k_d: f64) -> Self {
        Self {
            k_p,
            k_i,
            k_d,
            integral: 0f64,
            prev_error: None,
        }
    }

    /// Get the value of the controller for the given error.
    ///
    /// `dt` is the time since the previous call, or `None` if there is no meaningful previous
    /// call. Without a time difference neither the integral nor the derivative are updated, as
    /// either would produce a large spike compared to normal operation.
    pub fn get(&mut self, error: f64, dt: Option<f64>) -> f64 {
        let dt = dt.filter(|t| *t > 0.0);

        // Accumulate the integral term.
        self.integral += match dt {
            Some(t) => error * t,
            None => 0f64,
        };

        // Calculate the derivative.
        let deriv = match (self.prev_error, dt) {
            (Some(e), Some(t)) => (error - e) / t,
            _ => 0f64,
        };

        // Calculate the output
        let out = self.k_p * error + self.k_i * self.integral + self.k_d * deriv;

        // Remember the previous error
        self.prev_error = Some(error);

        out
    }

    /// Forget the integral and previous error.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
    }
}

impl SpeedController {
    pub fn new(params: &SpeedCtrlParams, drive: DriveChannel, demand: SpeedDemand) -> Self {
        Self {
            pid: PidController::new(params.k_p, params.k_i, params.k_d),
            drive,
            demand,
            prev_time: None,
        }
    }

    /// Process one state, returning the new throttle if one was written.
    pub fn step(&mut self, state: &CompositeState) -> Option<f64> {
        if state.geo.is_none() || self.drive.foot_brake() > 0 {
            self.pid.reset();
            self.prev_time = None;
            return None;
        }

        let dt = self
            .prev_time
            .and_then(|t| duration_to_seconds(state.timestamp - t));
        self.prev_time = Some(state.timestamp);

        let target_kmh = self.demand.get();
        let speed_error = state.speed_kmh() - target_kmh;

        let correction = self.pid.get(speed_error, dt);
        let throttle = self.drive.set_throttle(self.drive.throttle() - correction);

        trace!(
            "SpeedCtrl: speed {:.2} km/h, target {:.2} km/h, throttle {:.4}",
            state.speed_kmh(),
            target_kmh,
            throttle
        );

        Some(throttle)
    }

    /// Run the loop until the subscription is cancelled or completes.
    pub fn run(
        mut self,
        subscription: Subscription<Arc<CompositeState>>,
        token: &CancelToken,
    ) -> WaitError {
        info!("Speed loop started");

        loop {
            match subscription.next(token) {
                Ok(state) => {
                    self.step(&state);
                }
                Err(e) => {
                    info!("Speed loop stopped: {}", e);
                    return e;
                }
            }
        }
    }
}
