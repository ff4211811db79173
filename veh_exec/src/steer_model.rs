//! # Steering models
//!
//! A steering model holds the latest lateral state of the vehicle (errors, steering angle, speed
//! and path curvature) and its linearised discrete dynamics about that state. The trajectory
//! controller updates the model every tick and reads the speed and time step from it.
//!
//! The state vector is `[lat_error_m, head_error_rad]` and the input is the steering angle.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Latest inputs given to a model.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct ModelState {
    pub lat_error_m: f64,
    pub head_error_rad: f64,
    pub steer_angle_rad: f64,
    pub speed_ms: f64,
    pub curvature_m: f64,
}

/// Kinematic bicycle model.
///
/// Linearised about small heading errors and steering angles:
///
/// ```text
/// lat[k+1]  = lat[k] + v dt head[k]
/// head[k+1] = head[k] + (v dt / L) steer[k] - v dt curv
/// ```
#[derive(Debug, Clone)]
pub struct BicycleModel {
    wheelbase_m: f64,
    dt_s: f64,
    state: ModelState,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Selects the steering model, loaded from `steer_model.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SteerModelParams {
    Bicycle {
        /// Distance between the axles
        wheelbase_m: f64,

        /// Time step of the model, normally the sample period
        dt_s: f64,
    },
}

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Capability contract of a steering model.
pub trait SteeringModel: Send {
    /// Update the model with the latest state of the vehicle.
    fn update_a(
        &mut self,
        lat_error_m: f64,
        head_error_rad: f64,
        steer_angle_rad: f64,
        speed_ms: f64,
        curvature_m: f64,
    );

    /// The latest state given to [`SteeringModel::update_a`].
    fn state(&self) -> &ModelState;

    /// Time step of the model.
    fn dt_s(&self) -> f64;

    fn wheelbase_m(&self) -> f64;

    /// State transition matrix about the current state.
    fn a_matrix(&self) -> Matrix2<f64>;

    /// Input matrix about the current state.
    fn b_matrix(&self) -> Vector2<f64>;

    fn vehicle_speed_ms(&self) -> f64 {
        self.state().speed_ms
    }

    fn lateral_error_m(&self) -> f64 {
        self.state().lat_error_m
    }

    fn heading_error_rad(&self) -> f64 {
        self.state().head_error_rad
    }

    fn curvature_m(&self) -> f64 {
        self.state().curvature_m
    }
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SteerModelParams {
    /// Build the model selected by these parameters.
    pub fn build(&self) -> Box<dyn SteeringModel> {
        match *self {
            SteerModelParams::Bicycle { wheelbase_m, dt_s } => {
                Box::new(BicycleModel::new(wheelbase_m, dt_s))
            }
        }
    }
}

impl BicycleModel {
    pub fn new(wheelbase_m: f64, dt_s: f64) -> Self {
        Self {
            wheelbase_m,
            dt_s,
            state: ModelState::default(),
        }
    }
}

impl SteeringModel for BicycleModel {
    fn update_a(
        &mut self,
        lat_error_m: f64,
        head_error_rad: f64,
        steer_angle_rad: f64,
        speed_ms: f64,
        curvature_m: f64,
    ) {
        self.state = ModelState {
            lat_error_m,
            head_error_rad,
            steer_angle_rad,
            speed_ms,
            curvature_m,
        };
    }

    fn state(&self) -> &ModelState {
        &self.state
    }

    fn dt_s(&self) -> f64 {
        self.dt_s
    }

    fn wheelbase_m(&self) -> f64 {
        self.wheelbase_m
    }

    fn a_matrix(&self) -> Matrix2<f64> {
        Matrix2::new(1.0, self.state.speed_ms * self.dt_s, 0.0, 1.0)
    }

    fn b_matrix(&self) -> Vector2<f64> {
        Vector2::new(0.0, self.state.speed_ms * self.dt_s / self.wheelbase_m)
    }
}
