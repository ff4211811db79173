//! # Communications interface crate.
//!
//! Provides the communications interfaces shared between the vehicle software and the simulator:
//! the telemetry and actuation messages, and the stream they travel over.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Telemetry and actuation definitions for the vehicle equipment
pub mod eqpt;

/// Network module
pub mod net;
