//! # Vehicle library.
//!
//! The closed-loop control core of the autonomous vehicle. Telemetry from the vehicle interface is
//! fused into a pose, turned into path errors by the navigator and published on the information
//! stream. The speed loop and the path follower both subscribe to that stream and write their
//! demands into the shared operation, which the actuation loop sends back to the vehicle.
//!
//! [`auto_pilot::AutoPilot`] ties all of this together and is the entry point for executables.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Actuation loop - periodically sends the current operation to the vehicle
pub mod actuation;

/// Auto pilot - lifecycle of the control loops
pub mod auto_pilot;

/// Sensor fusion - turns raw telemetry into a planar pose
pub mod fusion;

/// Information stream - multicast stream of composite states
pub mod info_stream;

/// Navigation - route following and path error calculation
pub mod nav;

/// Operation - the actuation demands shared between the control loops
pub mod operation;

/// Executable parameters
pub mod params;

/// Simulation client - connects the vehicle software to the simulator
pub mod sim_client;

/// Speed control - PID regulation of the throttle
pub mod speed_ctrl;

/// Steering models - linearised lateral dynamics of the vehicle
pub mod steer_model;

/// Trajectory control - keeps the vehicle on the active path
pub mod traj_ctrl;

/// Transport - capability traits implemented by vehicle connectors
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;
