//! # Vehicle Equipment Communications Module
//!
//! Messages exchanged with the vehicle interface. The simulator publishes one [`TelemetrySample`]
//! per sensor update and accepts an [`Operation`] whenever the vehicle software wants to actuate.
//! Both travel inside a [`SimMessage`] so that a single line-delimited stream can carry them.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Raw state of the vehicle's actuators and odometry.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct VehicleTelemetry {
    /// Signed speed of the vehicle in km/h, negative when reversing.
    pub speed_kmh: f64,

    /// Current angle of the front wheels in radians, positive to the right.
    pub steer_angle_rad: f64,

    /// Throttle currently applied, in [-1, 1].
    pub throttle: f64,

    /// Current foot brake level, 0 is released.
    pub foot_brake: i32,
}

/// A position fix from the GNSS receiver.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct GnssFix {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
}

/// A reading from the inertial unit.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct ImuReading {
    /// Yaw of the vehicle in radians, measured clockwise from north.
    pub yaw_rad: f64,

    /// Yaw rate in radians per second.
    #[serde(default)]
    pub yaw_rate_rads: f64,
}

/// One telemetry sample from the vehicle interface.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TelemetrySample {
    /// UTC timestamp at which the sample was taken
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    pub vehicle: VehicleTelemetry,

    pub gnss: GnssFix,

    pub imu: ImuReading,
}

/// Actuation command sent to the vehicle.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Operation {
    /// Throttle demand in [-1, 1]. Negative values drive in reverse.
    pub throttle: f64,

    /// Foot brake level, 0 releases the brake.
    pub foot_brake: i32,

    /// Steering angle demand in radians, positive to the right.
    pub steer_angle_rad: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Any message that can travel over the simulator stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum SimMessage {
    /// Telemetry published by the simulator
    Telemetry(TelemetrySample),

    /// Actuation demands sent to the simulator
    Operation(Operation),
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sim_message_wire_format() {
        let msg = SimMessage::Operation(Operation {
            throttle: 0.25,
            foot_brake: 2,
            steer_angle_rad: -0.1,
        });

        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"Operation":{"throttle":0.25,"foot_brake":2,"steer_angle_rad":-0.1}}"#
        );

        // The yaw rate is optional on the wire
        let json = r#"{"Telemetry":{
            "timestamp":1600000000000,
            "vehicle":{"speed_kmh":-3.5,"steer_angle_rad":0.0,"throttle":-0.2,"foot_brake":0},
            "gnss":{"latitude_deg":52.0,"longitude_deg":-1.5,"altitude_m":80.0},
            "imu":{"yaw_rad":1.2}
        }}"#;

        match serde_json::from_str::<SimMessage>(json).unwrap() {
            SimMessage::Telemetry(t) => {
                assert_eq!(t.timestamp, Utc.timestamp_millis(1600000000000));
                assert_eq!(t.vehicle.speed_kmh, -3.5);
                assert_eq!(t.imu.yaw_rad, 1.2);
                assert_eq!(t.imu.yaw_rate_rads, 0.0);
            }
            m => panic!("Expected telemetry, got {:?}", m),
        }
    }
}
