//! # Predictive functional control
//!
//! The reference trajectory is a cubic Bezier curve in the error frame, from the vehicle at
//! `(lat, 0)` with its heading, to a lookahead point on the path with the path's heading. The
//! control arms of the curve are `margin` long:
//!
//! ```text
//! conv_dist       = T_c |v|
//! margin          = sharpness conv_dist / 2
//! target_position = i dt / T_c
//! look_ahead      = conv_dist target_position
//!
//! P0 = (lat, 0)
//! P1 = P0 + margin (sin h0, cos h0)
//! P2 = P3 - margin (sin h3, cos h3)
//! P3 = lookahead point
//! ```
//!
//! The reference is the curve evaluated at `target_position`. Once `target_position` passes 1 the
//! vehicle should already be on the path, and the lookahead point itself is the reference.
//!
//! When reversing the point is negated, which expresses it in the frame rotated by half a turn in
//! which the reverse loop describes the vehicle.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::trace;
use nalgebra::Vector2;
use serde::Serialize;
use util::maths::wrap_pi;

use super::{TrajCtrlError, TrajCtrlParams};
use crate::{
    nav::{Navigator, TrajectoryPoint},
    steer_model::SteeringModel,
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Below this derivative magnitude the curve is treated as degenerate.
const MIN_DERIVATIVE_NORM: f64 = 1e-9;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Output of the control law for one tick.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PfcReference {
    /// The reference point, in the frame of the model
    pub point: TrajectoryPoint,

    /// Lateral position of the reference on the curve, before any reverse negation
    pub lateral_offset_m: f64,

    /// Curvature of the path, used for feed-forward
    pub path_curvature_m: f64,

    pub target_position: f64,
    pub look_ahead_m: f64,

    /// Set if `target_position` passed 1 and the lookahead point was used directly
    pub clamped: bool,
}

/// A cubic Bezier curve in the plane.
#[derive(Debug, Clone, Copy)]
pub struct CubicBezier {
    pub p: [Vector2<f64>; 4],
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl CubicBezier {
    pub fn new(p0: Vector2<f64>, p1: Vector2<f64>, p2: Vector2<f64>, p3: Vector2<f64>) -> Self {
        Self {
            p: [p0, p1, p2, p3],
        }
    }

    pub fn point(&self, t: f64) -> Vector2<f64> {
        let u = 1.0 - t;
        self.p[0] * (u * u * u)
            + self.p[1] * (3.0 * u * u * t)
            + self.p[2] * (3.0 * u * t * t)
            + self.p[3] * (t * t * t)
    }

    pub fn derivative(&self, t: f64) -> Vector2<f64> {
        let u = 1.0 - t;
        (self.p[1] - self.p[0]) * (3.0 * u * u)
            + (self.p[2] - self.p[1]) * (6.0 * u * t)
            + (self.p[3] - self.p[2]) * (3.0 * t * t)
    }

    pub fn second_derivative(&self, t: f64) -> Vector2<f64> {
        let u = 1.0 - t;
        (self.p[2] - self.p[1] * 2.0 + self.p[0]) * (6.0 * u)
            + (self.p[3] - self.p[2] * 2.0 + self.p[1]) * (6.0 * t)
    }

    /// Heading at `t`, clockwise from +y. `None` where the curve is degenerate.
    pub fn heading(&self, t: f64) -> Option<f64> {
        let d = self.derivative(t);
        if d.norm() < MIN_DERIVATIVE_NORM {
            None
        }
        else {
            Some(d[0].atan2(d[1]))
        }
    }

    /// Curvature at `t`, positive when turning clockwise. Zero where the curve is degenerate.
    pub fn curvature(&self, t: f64) -> f64 {
        let d = self.derivative(t);
        let dd = self.second_derivative(t);
        let norm = d.norm();

        if norm < MIN_DERIVATIVE_NORM {
            return 0.0;
        }

        (d[1] * dd[0] - d[0] * dd[1]) / norm.powi(3)
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Compute the reference for tick `tick` of the epoch from the model's current state.
pub fn reference(
    tick: u64,
    model: &dyn SteeringModel,
    nav: &dyn Navigator,
    params: &TrajCtrlParams,
) -> Result<PfcReference, TrajCtrlError> {
    let speed_ms = model.vehicle_speed_ms();
    let reversing = speed_ms < 0.0;

    let lat_m = if reversing {
        -model.lateral_error_m()
    }
    else {
        model.lateral_error_m()
    };
    let head_rad = wrap_pi(model.heading_error_rad());

    let conv_dist_m = params.convergence_time_s * speed_ms.abs();
    let margin_m = params.sharpness * conv_dist_m / 2.0;

    let target_position = tick as f64 * model.dt_s() / params.convergence_time_s;
    let look_ahead_m = conv_dist_m * target_position;

    let forward = !(nav.current_path().map(|p| p.is_back()).unwrap_or(false)
        || nav.next_path().map(|p| p.is_back()).unwrap_or(false));

    let target = nav
        .look_ahead_point(look_ahead_m, forward)
        .ok_or(TrajCtrlError::NoLookAhead)?;

    let (mut point, lateral_offset_m, clamped) = if target_position > 1.0 {
        let point = TrajectoryPoint {
            x_m: target.x_m,
            y_m: target.y_m,
            heading_rad: target.heading_rad,
            curvature_m: 0.0,
            velocity_ms: 0.0,
        };
        (point, target.x_m, true)
    }
    else {
        let curve = bezier(lat_m, head_rad, &target, margin_m);
        let p = curve.point(target_position);

        let heading_rad = curve.heading(target_position).unwrap_or_else(|| {
            wrap_pi(head_rad + target_position * wrap_pi(target.heading_rad - head_rad))
        });

        let point = TrajectoryPoint {
            x_m: p[0],
            y_m: p[1],
            heading_rad,
            curvature_m: curve.curvature(target_position),
            velocity_ms: speed_ms,
        };
        (point, p[0], false)
    };

    if reversing {
        point.x_m = -point.x_m;
        point.y_m = -point.y_m;
    }

    trace!(
        "PFC: i {}, tp {:.3}, look {:.2} m, point ({:.3}, {:.3}) {:.3} rad",
        tick,
        target_position,
        look_ahead_m,
        point.x_m,
        point.y_m,
        point.heading_rad
    );

    Ok(PfcReference {
        point,
        lateral_offset_m,
        path_curvature_m: model.curvature_m(),
        target_position,
        look_ahead_m,
        clamped,
    })
}

/// Build the reference curve from the vehicle to the target point.
pub fn bezier(lat_m: f64, head_rad: f64, target: &TrajectoryPoint, margin_m: f64) -> CubicBezier {
    let p0 = Vector2::new(lat_m, 0.0);
    let p3 = Vector2::new(target.x_m, target.y_m);

    let p1 = p0 + Vector2::new(head_rad.sin(), head_rad.cos()) * margin_m;
    let p2 = p3 - Vector2::new(target.heading_rad.sin(), target.heading_rad.cos()) * margin_m;

    CubicBezier::new(p0, p1, p2, p3)
}
