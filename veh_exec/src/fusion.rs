//! # Sensor fusion
//!
//! Turns the raw telemetry of one sample into a [`FusedPose`]:
//!
//! 1. The GNSS fix is projected onto a local planar frame (x east, y north) with an
//!    equirectangular projection about the configured origin, or the first fix if none is given.
//! 2. The raw IMU yaw is passed through the heading filter, together with the planar position,
//!    steering angle and speed.
//! 3. The antenna offset is removed from the position along the corrected heading.
//!
//! Headings are measured clockwise from north (+y). The heading filter is stateful, so the
//! adapter must be fed every sample exactly once and in order.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::eqpt::vehicle::{GnssFix, ImuReading, VehicleTelemetry};
use log::{debug, info};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use util::maths::wrap_pi;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Mean radius of the earth used by the local projection.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Conversion factor from km/h to m/s.
pub const KMH_TO_MS: f64 = 1.0 / 3.6;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters of the fusion adapter, loaded from `fusion.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionParams {
    /// Distance from the reference point of the vehicle to the GNSS antenna, along the heading.
    pub antenna_offset_m: f64,

    /// Origin of the local planar frame. If not provided the first fix is used.
    #[serde(default)]
    pub origin: Option<GeoOrigin>,

    /// The heading filter to apply.
    pub heading_filter: HeadingFilterParams,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoOrigin {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

/// A pose in the local planar frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FusedPose {
    /// Position in meters, x east and y north.
    pub position_m: Vector2<f64>,

    /// Heading in radians, clockwise from north.
    pub heading_rad: f64,
}

/// Equirectangular projection about a fixed origin.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    origin: GeoOrigin,
    cos_lat: f64,
}

/// Heading filter which passes the raw heading through.
#[derive(Debug, Default)]
pub struct RawHeading;

/// Heading filter which blends the course over ground into the heading.
///
/// While the vehicle is moving steadily and roughly straight, the direction between successive
/// positions is a good measure of the heading. A fraction of the difference between this course
/// and the corrected heading is accumulated into an offset which is applied to the raw yaw, so
/// that a biased IMU is slowly pulled into line with the GNSS track.
#[derive(Debug)]
pub struct CourseBlend {
    gain: f64,
    min_speed_ms: f64,
    max_steer_rad: f64,
    min_distance_m: f64,

    offset_rad: f64,
    last_position_m: Option<Vector2<f64>>,
}

/// The fusion adapter itself.
pub struct FusionAdapter {
    antenna_offset_m: f64,
    projection: Option<LocalProjection>,
    filter: Box<dyn HeadingFilter>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Selects the heading filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HeadingFilterParams {
    Raw,
    CourseBlend {
        /// Fraction of the course innovation accumulated each sample
        gain: f64,

        /// Minimum speed at which the course is trusted
        min_speed_ms: f64,

        /// Maximum steering angle magnitude at which the course is trusted
        max_steer_rad: f64,

        /// Minimum distance between the positions used to compute the course
        min_distance_m: f64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("Invalid GNSS fix: {0:?}")]
    InvalidFix(GnssFix),

    #[error("Invalid heading: {0}")]
    InvalidHeading(f64),
}

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A filter correcting the raw heading of the vehicle.
pub trait HeadingFilter: Send {
    /// Correct the raw heading for this sample, updating the filter's state.
    fn correct(
        &mut self,
        raw_heading_rad: f64,
        position_m: Vector2<f64>,
        steer_angle_rad: f64,
        speed_ms: f64,
    ) -> f64;
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl LocalProjection {
    pub fn new(origin: GeoOrigin) -> Self {
        Self {
            origin,
            cos_lat: origin.latitude_deg.to_radians().cos(),
        }
    }

    /// Project the fix into the local frame.
    pub fn project(&self, fix: &GnssFix) -> Vector2<f64> {
        let d_lat = (fix.latitude_deg - self.origin.latitude_deg).to_radians();
        let d_lon = (fix.longitude_deg - self.origin.longitude_deg).to_radians();

        Vector2::new(
            EARTH_RADIUS_M * d_lon * self.cos_lat,
            EARTH_RADIUS_M * d_lat,
        )
    }

    pub fn origin(&self) -> GeoOrigin {
        self.origin
    }
}

impl HeadingFilter for RawHeading {
    fn correct(&mut self, raw_heading_rad: f64, _: Vector2<f64>, _: f64, _: f64) -> f64 {
        wrap_pi(raw_heading_rad)
    }
}

impl CourseBlend {
    pub fn new(gain: f64, min_speed_ms: f64, max_steer_rad: f64, min_distance_m: f64) -> Self {
        Self {
            gain,
            min_speed_ms,
            max_steer_rad,
            min_distance_m,
            offset_rad: 0.0,
            last_position_m: None,
        }
    }

    /// The heading offset accumulated so far.
    pub fn offset_rad(&self) -> f64 {
        self.offset_rad
    }
}

impl HeadingFilter for CourseBlend {
    fn correct(
        &mut self,
        raw_heading_rad: f64,
        position_m: Vector2<f64>,
        steer_angle_rad: f64,
        speed_ms: f64,
    ) -> f64 {
        let corrected = wrap_pi(raw_heading_rad + self.offset_rad);

        let last = match self.last_position_m {
            Some(l) => l,
            None => {
                self.last_position_m = Some(position_m);
                return corrected;
            }
        };

        let delta = position_m - last;
        if delta.norm() < self.min_distance_m {
            return corrected;
        }
        self.last_position_m = Some(position_m);

        if speed_ms.abs() < self.min_speed_ms || steer_angle_rad.abs() > self.max_steer_rad {
            return corrected;
        }

        // Course over ground, flipped when reversing so it points where the nose does
        let mut course = delta[0].atan2(delta[1]);
        if speed_ms < 0.0 {
            course = wrap_pi(course + std::f64::consts::PI);
        }

        let innovation = wrap_pi(course - corrected);
        self.offset_rad = wrap_pi(self.offset_rad + self.gain * innovation);

        wrap_pi(raw_heading_rad + self.offset_rad)
    }
}

impl FusionAdapter {
    /// Create a new adapter from the parameters.
    pub fn new(params: &FusionParams) -> Self {
        let filter: Box<dyn HeadingFilter> = match params.heading_filter {
            HeadingFilterParams::Raw => Box::new(RawHeading),
            HeadingFilterParams::CourseBlend {
                gain,
                min_speed_ms,
                max_steer_rad,
                min_distance_m,
            } => Box::new(CourseBlend::new(
                gain,
                min_speed_ms,
                max_steer_rad,
                min_distance_m,
            )),
        };

        Self::with_filter(params, filter)
    }

    /// Create a new adapter using a custom heading filter.
    pub fn with_filter(params: &FusionParams, filter: Box<dyn HeadingFilter>) -> Self {
        Self {
            antenna_offset_m: params.antenna_offset_m,
            projection: params.origin.map(LocalProjection::new),
            filter,
        }
    }

    /// Fuse the raw telemetry of one sample into a pose.
    pub fn fuse(
        &mut self,
        gnss: &GnssFix,
        imu: &ImuReading,
        vehicle: &VehicleTelemetry,
    ) -> Result<FusedPose, FusionError> {
        if !gnss.latitude_deg.is_finite()
            || !gnss.longitude_deg.is_finite()
            || gnss.latitude_deg.abs() > 90.0
        {
            return Err(FusionError::InvalidFix(*gnss));
        }
        if !imu.yaw_rad.is_finite() {
            return Err(FusionError::InvalidHeading(imu.yaw_rad));
        }

        let projection = match self.projection {
            Some(p) => p,
            None => {
                let p = LocalProjection::new(GeoOrigin {
                    latitude_deg: gnss.latitude_deg,
                    longitude_deg: gnss.longitude_deg,
                });
                info!("Local frame origin set to first fix: {:?}", p.origin());
                self.projection = Some(p);
                p
            }
        };

        let antenna_m = projection.project(gnss);

        let heading_rad = self.filter.correct(
            imu.yaw_rad,
            antenna_m,
            vehicle.steer_angle_rad,
            vehicle.speed_kmh * KMH_TO_MS,
        );

        // Remove the antenna offset along the corrected heading
        let position_m = Vector2::new(
            antenna_m[0] - self.antenna_offset_m * heading_rad.sin(),
            antenna_m[1] - self.antenna_offset_m * heading_rad.cos(),
        );

        debug!(
            "Fused pose: ({:.3}, {:.3}) m, {:.4} rad",
            position_m[0], position_m[1], heading_rad
        );

        Ok(FusedPose {
            position_m,
            heading_rad,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn params(offset: f64) -> FusionParams {
        FusionParams {
            antenna_offset_m: offset,
            origin: Some(GeoOrigin {
                latitude_deg: 0.0,
                longitude_deg: 0.0,
            }),
            heading_filter: HeadingFilterParams::Raw,
        }
    }

    fn fix_at(proj: &LocalProjection, x: f64, y: f64) -> GnssFix {
        // Invert the projection
        let origin = proj.origin();
        GnssFix {
            latitude_deg: origin.latitude_deg + (y / EARTH_RADIUS_M).to_degrees(),
            longitude_deg: origin.longitude_deg
                + (x / (EARTH_RADIUS_M * origin.latitude_deg.to_radians().cos())).to_degrees(),
            altitude_m: 0.0,
        }
    }

    #[test]
    fn test_antenna_offset() {
        let p = params(1.5);
        let proj = LocalProjection::new(p.origin.unwrap());
        let mut fusion = FusionAdapter::new(&p);

        // Heading east, antenna 1.5 m ahead of the reference point
        let pose = fusion
            .fuse(
                &fix_at(&proj, 10.0, 20.0),
                &ImuReading {
                    yaw_rad: FRAC_PI_2,
                    yaw_rate_rads: 0.0,
                },
                &VehicleTelemetry::default(),
            )
            .unwrap();

        assert!((pose.position_m[0] - 8.5).abs() < 1e-6);
        assert!((pose.position_m[1] - 20.0).abs() < 1e-6);
        assert!((pose.heading_rad - FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn test_first_fix_origin() {
        let mut p = params(0.0);
        p.origin = None;
        let mut fusion = FusionAdapter::new(&p);

        let fix = GnssFix {
            latitude_deg: 51.5,
            longitude_deg: -0.1,
            altitude_m: 0.0,
        };
        let pose = fusion
            .fuse(&fix, &ImuReading::default(), &VehicleTelemetry::default())
            .unwrap();
        assert!(pose.position_m.norm() < 1e-9);

        let bad = GnssFix {
            latitude_deg: f64::NAN,
            ..fix
        };
        assert!(matches!(
            fusion.fuse(&bad, &ImuReading::default(), &VehicleTelemetry::default()),
            Err(FusionError::InvalidFix(_))
        ));
    }

    #[test]
    fn test_course_blend_converges() {
        // IMU reads 0.2 rad too far right while the vehicle drives due north
        let mut filter = CourseBlend::new(0.2, 0.5, 0.1, 0.1);

        let mut heading = 0.0;
        for i in 0..100 {
            let pos = Vector2::new(0.0, i as f64 * 0.5);
            heading = filter.correct(0.2, pos, 0.0, 5.0);
        }

        assert!(heading.abs() < 1e-3);
        assert!((filter.offset_rad() + 0.2).abs() < 1e-3);

        // Reversing south with the nose pointing north gives the same course
        let mut filter = CourseBlend::new(0.2, 0.5, 0.1, 0.1);
        for i in 0..100 {
            let pos = Vector2::new(0.0, -(i as f64) * 0.5);
            heading = filter.correct(0.2, pos, 0.0, -5.0);
        }
        assert!(heading.abs() < 1e-3);

        // Turning hard, nothing is learnt
        let mut filter = CourseBlend::new(0.2, 0.5, 0.1, 0.1);
        for i in 0..10 {
            let pos = Vector2::new(0.0, i as f64 * 0.5);
            heading = filter.correct(PI / 4.0, pos, 0.5, 5.0);
        }
        assert_eq!(filter.offset_rad(), 0.0);
        assert!((heading - PI / 4.0).abs() < 1e-12);
    }
}
