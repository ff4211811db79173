//! # Steering controllers
//!
//! Turn a [`PfcReference`] into a steering angle demand. The controller is selected once from the
//! parameters:
//!
//! - [`PursuitController`] steers towards the reference point, bicycle pure-pursuit style, adding
//!   the path curvature as feed-forward.
//! - [`LqrController`] regulates the model's `[lat, head]` state with a discrete LQR gain computed
//!   from the model's linearised dynamics, adding the same feed-forward.
//!
//! Both are evaluated in the model's frame and saturated to the maximum steering angle.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::trace;
use nalgebra::{Matrix2, RowVector2, Vector2};
use serde::{Deserialize, Serialize};
use util::maths::wrap_pi;

use super::{PfcReference, TrajCtrlParams};
use crate::{operation::MAX_STEER_ANGLE_RAD, steer_model::SteeringModel};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Pursuit of the reference point plus curvature feed-forward.
#[derive(Debug, Clone)]
pub struct PursuitController {
    far_angle_rad: f64,
    near_angle_rad: f64,
    min_pursuit_distance_m: f64,
}

/// Finite horizon discrete LQR.
#[derive(Debug, Clone)]
pub struct LqrController {
    q: Matrix2<f64>,
    r: f64,
    iterations: usize,
    near_angle_rad: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Selects the steering controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SteeringControllerParams {
    Pfc,

    Lqr {
        /// Weight on the lateral error
        q_lat: f64,

        /// Weight on the heading error
        q_head: f64,

        /// Weight on the steering input
        r: f64,

        /// Number of Riccati iterations
        iterations: usize,
    },
}

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

pub trait SteeringController: Send {
    /// Compute the steering angle demand for this reference.
    fn steer(&mut self, reference: &PfcReference, model: &dyn SteeringModel) -> f64;
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SteeringControllerParams {
    pub fn build(&self, params: &TrajCtrlParams) -> Box<dyn SteeringController> {
        match *self {
            SteeringControllerParams::Pfc => Box::new(PursuitController {
                far_angle_rad: params.far_angle_rad,
                near_angle_rad: params.near_angle_rad,
                min_pursuit_distance_m: params.min_pursuit_distance_m,
            }),
            SteeringControllerParams::Lqr {
                q_lat,
                q_head,
                r,
                iterations,
            } => Box::new(LqrController {
                q: Matrix2::new(q_lat, 0.0, 0.0, q_head),
                r,
                iterations,
                near_angle_rad: params.near_angle_rad,
            }),
        }
    }
}

impl SteeringController for PursuitController {
    fn steer(&mut self, reference: &PfcReference, model: &dyn SteeringModel) -> f64 {
        let sign = direction_sign(model);
        let wheelbase_m = model.wheelbase_m();

        let origin = Vector2::new(model.lateral_error_m(), 0.0);
        let travel_heading_rad = if model.vehicle_speed_ms() < 0.0 {
            wrap_pi(model.heading_error_rad() + std::f64::consts::PI)
        }
        else {
            wrap_pi(model.heading_error_rad())
        };

        let rel = Vector2::new(reference.point.x_m, reference.point.y_m) - origin;
        let dist_m = rel.norm();

        let traj_rad = if dist_m > self.min_pursuit_distance_m {
            let alpha = wrap_pi(rel[0].atan2(rel[1]) - travel_heading_rad)
                .clamp(-self.far_angle_rad, self.far_angle_rad);
            (2.0 * wheelbase_m * alpha.sin() / dist_m).atan()
        }
        else {
            (wheelbase_m * reference.point.curvature_m).atan()
        };

        let ff_rad = feed_forward(reference, wheelbase_m, self.near_angle_rad);

        let steer = saturate(sign * (traj_rad + ff_rad));

        trace!(
            "Pursuit: dist {:.3} m, traj {:.4} rad, ff {:.4} rad, steer {:.4} rad",
            dist_m,
            traj_rad,
            ff_rad,
            steer
        );

        steer
    }
}

impl LqrController {
    /// Compute the feedback gain for the model's current dynamics.
    pub fn gain(&self, a: &Matrix2<f64>, b: &Vector2<f64>) -> RowVector2<f64> {
        let mut p = self.q;
        let mut k = RowVector2::zeros();

        for _ in 0..self.iterations.max(1) {
            let denom = self.r + (b.transpose() * p * b)[0];
            if denom.abs() < f64::EPSILON {
                return RowVector2::zeros();
            }

            k = (b.transpose() * p * a) / denom;
            p = self.q + a.transpose() * p * a - a.transpose() * p * b * k;
        }

        k
    }
}

impl SteeringController for LqrController {
    fn steer(&mut self, reference: &PfcReference, model: &dyn SteeringModel) -> f64 {
        let k = self.gain(&model.a_matrix(), &model.b_matrix());
        let x = Vector2::new(model.lateral_error_m(), wrap_pi(model.heading_error_rad()));

        let feedback_rad = -(k * x)[0];
        let ff_rad = feed_forward(reference, model.wheelbase_m(), self.near_angle_rad);

        let steer = saturate(feedback_rad + direction_sign(model) * ff_rad);

        trace!(
            "LQR: K [{:.4}, {:.4}], fb {:.4} rad, ff {:.4} rad, steer {:.4} rad",
            k[0],
            k[1],
            feedback_rad,
            ff_rad,
            steer
        );

        steer
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// `1` moving forwards or stationary, `-1` reversing.
fn direction_sign(model: &dyn SteeringModel) -> f64 {
    if model.vehicle_speed_ms() < 0.0 {
        -1.0
    }
    else {
        1.0
    }
}

/// Steering angle which holds the path curvature, limited to the near angle.
fn feed_forward(reference: &PfcReference, wheelbase_m: f64, limit_rad: f64) -> f64 {
    (wheelbase_m * reference.path_curvature_m)
        .atan()
        .clamp(-limit_rad, limit_rad)
}

fn saturate(angle_rad: f64) -> f64 {
    if angle_rad.is_nan() {
        0.0
    }
    else {
        angle_rad.clamp(-MAX_STEER_ANGLE_RAD, MAX_STEER_ANGLE_RAD)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{nav::TrajectoryPoint, steer_model::BicycleModel};

    fn reference(x_m: f64, y_m: f64, path_curvature_m: f64) -> PfcReference {
        PfcReference {
            point: TrajectoryPoint {
                x_m,
                y_m,
                ..Default::default()
            },
            lateral_offset_m: x_m,
            path_curvature_m,
            target_position: 0.5,
            look_ahead_m: y_m,
            clamped: false,
        }
    }

    fn model(lat: f64, head: f64, speed_ms: f64) -> BicycleModel {
        let mut m = BicycleModel::new(2.5, 0.1);
        m.update_a(lat, head, 0.0, speed_ms, 0.0);
        m
    }

    #[test]
    fn test_pursuit_steers_towards_point() {
        let mut ctrl = SteeringControllerParams::Pfc.build(&TrajCtrlParams::default());

        // Vehicle right of the path, reference on the path ahead: steer left
        assert!(ctrl.steer(&reference(0.0, 3.0, 0.0), &model(0.5, 0.0, 2.0)) < 0.0);

        // Vehicle left of the path: steer right
        assert!(ctrl.steer(&reference(0.0, 3.0, 0.0), &model(-0.5, 0.0, 2.0)) > 0.0);

        // On the path, pointing along it
        assert_eq!(ctrl.steer(&reference(0.0, 3.0, 0.0), &model(0.0, 0.0, 2.0)), 0.0);

        // Reversing, the point is behind and the steering sign inverts
        let rev = ctrl.steer(&reference(-0.5, -3.0, 0.0), &model(0.0, 0.0, -2.0));
        assert!(rev < 0.0);
    }

    #[test]
    fn test_pursuit_converges() {
        let mut ctrl = SteeringControllerParams::Pfc.build(&TrajCtrlParams::default());

        let mut prev = f64::INFINITY;
        for i in 0..10 {
            let lat = 1.0 - i as f64 * 0.1;
            let steer = ctrl.steer(&reference(0.0, 3.0, 0.0), &model(lat, 0.0, 2.0));
            assert!(steer.abs() <= prev);
            prev = steer.abs();
        }

        let last = ctrl.steer(&reference(0.0, 3.0, 0.0), &model(0.0, 0.0, 2.0));
        assert!(last.abs() < 1e-12);
    }

    #[test]
    fn test_outputs_saturate() {
        let params = TrajCtrlParams {
            far_angle_rad: std::f64::consts::PI,
            ..Default::default()
        };
        let mut pfc = SteeringControllerParams::Pfc.build(&params);
        let mut lqr = SteeringControllerParams::Lqr {
            q_lat: 1000.0,
            q_head: 1000.0,
            r: 0.001,
            iterations: 50,
        }
        .build(&params);

        let r = reference(0.2, 0.1, 10.0);
        let m = model(-20.0, 1.0, 5.0);

        assert!(pfc.steer(&r, &m).abs() <= MAX_STEER_ANGLE_RAD);
        assert!(lqr.steer(&r, &m).abs() <= MAX_STEER_ANGLE_RAD);
    }

    #[test]
    fn test_lqr() {
        let ctrl = LqrController {
            q: Matrix2::new(1.0, 0.0, 0.0, 1.0),
            r: 1.0,
            iterations: 500,
            near_angle_rad: 0.2,
        };
        let m = model(0.5, 0.0, 2.0);

        let k = ctrl.gain(&m.a_matrix(), &m.b_matrix());
        assert!(k[0] > 0.0);
        assert!(k[1] > 0.0);

        // The closed loop drives the errors to zero
        let closed = m.a_matrix() - m.b_matrix() * k;
        let mut x = Vector2::new(1.0, 0.2);
        for _ in 0..1000 {
            x = closed * x;
        }
        assert!(x.norm() < 1e-3);

        // Stationary vehicles have no control authority
        let still = model(0.5, 0.0, 0.0);
        assert_eq!(ctrl.gain(&still.a_matrix(), &still.b_matrix()), RowVector2::zeros());

        // Right of the path, steer left
        let mut ctrl = ctrl;
        assert!(ctrl.steer(&reference(0.0, 3.0, 0.0), &m) < 0.0);
    }
}
