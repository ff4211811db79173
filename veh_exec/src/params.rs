//! # Vehicle Executable Parameters
//!
//! This module provides parameters for the vehicle executable, and gathers the parameters of every
//! module of the control core into a single [`AutoPilotConfig`].

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use util::params::{self, LoadError};

use crate::{
    fusion::FusionParams, speed_ctrl::SpeedCtrlParams, steer_model::SteerModelParams,
    traj_ctrl::TrajCtrlParams,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehExecParams {
    /// Rate at which the vehicle publishes telemetry
    pub sample_rate_hz: f64,

    /// Rate at which the operation is sent to the vehicle
    pub actuation_rate_hz: f64,

    /// Speed below which the vehicle is considered stopped
    pub stop_threshold_kmh: f64,

    /// Foot brake level applied when stopping
    pub brake_level: i32,

    /// Archive every steering tick into the session
    #[serde(default)]
    pub archive_steering: bool,
}

/// Everything needed to build an [`AutoPilot`](crate::auto_pilot::AutoPilot).
#[derive(Debug, Clone)]
pub struct AutoPilotConfig {
    pub exec: VehExecParams,
    pub fusion: FusionParams,
    pub speed_ctrl: SpeedCtrlParams,
    pub traj_ctrl: TrajCtrlParams,
    pub steer_model: SteerModelParams,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for VehExecParams {
    fn default() -> Self {
        Self {
            sample_rate_hz: 10.0,
            actuation_rate_hz: 20.0,
            stop_threshold_kmh: 0.1,
            brake_level: 2,
            archive_steering: false,
        }
    }
}

impl AutoPilotConfig {
    /// Load every parameter file from the software root's `params` directory.
    pub fn load() -> Result<Self, LoadError> {
        Ok(Self {
            exec: params::load("veh_exec.toml")?,
            fusion: params::load("fusion.toml")?,
            speed_ctrl: params::load("speed_ctrl.toml")?,
            traj_ctrl: params::load("traj_ctrl.toml")?,
            steer_model: params::load("steer_model.toml")?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{fs, path::PathBuf};

    /// The parameter files shipped with the software must all parse.
    #[test]
    fn test_shipped_params() {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../params");

        let _: VehExecParams = params::load_from_path(dir.join("veh_exec.toml")).unwrap();
        let _: FusionParams = params::load_from_path(dir.join("fusion.toml")).unwrap();
        let _: SpeedCtrlParams = params::load_from_path(dir.join("speed_ctrl.toml")).unwrap();
        let _: SteerModelParams = params::load_from_path(dir.join("steer_model.toml")).unwrap();
        let _: comms_if::net::NetParams = params::load_from_path(dir.join("net.toml")).unwrap();

        let traj: TrajCtrlParams = params::load_from_path(dir.join("traj_ctrl.toml")).unwrap();
        assert_eq!(traj.brake_level, 2);
        assert_eq!(traj.brake_hold_ms, 200);

        assert!(fs::metadata(dir).unwrap().is_dir());
    }
}
