//! # Control epochs
//!
//! An epoch is the control of the vehicle along one path. The [`PathFollower`] runs one epoch per
//! call to [`PathFollower::run_epoch`]:
//!
//! 1. Wait until the vehicle is moving.
//! 2. Forward paths tick on every state until the path changes.
//! 3. Reverse paths first stop the vehicle with the foot brake, hold it, and invert the target
//!    speed before releasing it. The ticks then run in the reversed frame, and once the path
//!    changes the vehicle is braked, held and the target speed inverted again.
//!
//! The epoch ends on the first state which carries a path change, or whose path index differs from
//! the one the epoch started on. No steering is written for that state.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::{sync::Arc, time::Duration};

use log::{debug, info, trace, warn};
use serde::Serialize;
use util::{
    archive::{get_elapsed_seconds, Archiver},
    cancel::CancelToken,
    maths::wrap_pi,
    session,
};

use super::{pfc, SteeringController, TrajCtrlError, TrajCtrlParams};
use crate::{
    info_stream::{CompositeState, Subscription},
    nav::{parse_curvature, SharedNavigator},
    operation::{DriveChannel, SpeedDemand, SteeringChannel},
    steer_model::SteeringModel,
};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Runs control epochs over the paths of the navigator's route.
pub struct PathFollower {
    params: TrajCtrlParams,
    model: Box<dyn SteeringModel>,
    controller: Box<dyn SteeringController>,
    nav: SharedNavigator,
    steering: SteeringChannel,
    drive: DriveChannel,
    demand: SpeedDemand,
    archive: Option<Archiver>,
}

/// Summary of a finished epoch, saved into the session.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EpochReport {
    pub path_index: usize,
    pub path_name: String,
    pub reversing: bool,

    /// Number of ticks which wrote a steering demand
    pub ticks: u64,

    pub end: EpochEnd,
}

/// One row of the steering archive.
#[derive(Debug, Clone, Serialize)]
struct SteerRecord {
    time_s: f64,
    seq: u64,
    path_index: usize,
    tick: u64,
    reversing: bool,
    lat_error_m: f64,
    head_error_rad: f64,
    speed_ms: f64,
    curvature_m: f64,
    target_position: f64,
    look_ahead_m: f64,
    ref_x_m: f64,
    ref_y_m: f64,
    ref_heading_rad: f64,
    lateral_offset_m: f64,
    steer_angle_rad: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum EpochEnd {
    /// The navigator moved onto the next path
    PathChanged,

    /// The last path of the route was completed
    RouteFinished,

    /// Automatic steering was disabled
    SteeringDisabled,
}

/// Why a tick loop stopped.
enum TickEnd {
    PathChanged,
    SteeringDisabled,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl PathFollower {
    pub fn new(
        params: TrajCtrlParams,
        model: Box<dyn SteeringModel>,
        nav: SharedNavigator,
        steering: SteeringChannel,
        drive: DriveChannel,
        demand: SpeedDemand,
    ) -> Self {
        let controller = params.controller.build(&params);

        Self {
            params,
            model,
            controller,
            nav,
            steering,
            drive,
            demand,
            archive: None,
        }
    }

    /// Record every steering tick into the given archive.
    pub fn with_archive(mut self, archive: Archiver) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Whether the navigator has completed its route.
    pub fn route_finished(&self) -> Result<bool, TrajCtrlError> {
        Ok(self.nav.lock()?.is_finished())
    }

    /// Run one epoch on the navigator's current path.
    pub fn run_epoch(
        &mut self,
        sub: &Subscription<Arc<CompositeState>>,
        token: &CancelToken,
    ) -> Result<EpochReport, TrajCtrlError> {
        let (path_index, path_name, reversing) = {
            let nav = self.nav.lock()?;
            let path = nav.current_path().ok_or(TrajCtrlError::NoActivePath)?;
            let index = nav
                .current_path_index()
                .ok_or(TrajCtrlError::NoActivePath)?;

            (index, path.name.clone(), path.is_back())
        };

        info!(
            "Starting {} epoch on path {} ({})",
            if reversing { "reverse" } else { "forward" },
            path_index,
            path_name
        );

        let mut report = EpochReport {
            path_index,
            path_name,
            reversing,
            ticks: 0,
            end: EpochEnd::PathChanged,
        };

        // Wait for the vehicle to move, unless the path changes first
        let threshold_kmh = self.params.motion_threshold_kmh;
        let first = sub.wait_for(token, |s| {
            s.speed_kmh().abs() > threshold_kmh || ends_epoch(s, path_index)
        })?;

        let tick_end = if ends_epoch(&first, path_index) {
            debug!("Path changed before the vehicle moved");
            TickEnd::PathChanged
        }
        else if reversing {
            self.steering.set_steer_angle(0.0);
            self.brake_and_invert(token)?;

            let end = self.follow(sub, token, path_index, true, &mut report.ticks)?;

            self.brake_and_invert(token)?;
            end
        }
        else {
            self.follow(sub, token, path_index, false, &mut report.ticks)?
        };

        report.end = match tick_end {
            TickEnd::SteeringDisabled => EpochEnd::SteeringDisabled,
            TickEnd::PathChanged if self.route_finished()? => EpochEnd::RouteFinished,
            TickEnd::PathChanged => EpochEnd::PathChanged,
        };

        info!(
            "Epoch on path {} ended after {} ticks: {:?}",
            report.path_index, report.ticks, report.end
        );
        session::save_with_timestamp("traj_ctrl/epoch.json", report.clone());

        Ok(report)
    }

    /// Tick on every state until the epoch ends.
    fn follow(
        &mut self,
        sub: &Subscription<Arc<CompositeState>>,
        token: &CancelToken,
        path_index: usize,
        reversing: bool,
        ticks: &mut u64,
    ) -> Result<TickEnd, TrajCtrlError> {
        loop {
            let state = sub.next(token)?;

            if ends_epoch(&state, path_index) {
                return Ok(TickEnd::PathChanged);
            }

            if !state.is_active {
                return Ok(TickEnd::SteeringDisabled);
            }

            if state.geo.is_none() {
                continue;
            }

            match self.tick(&state, *ticks, reversing) {
                Ok(_) => *ticks += 1,
                Err(TrajCtrlError::NoLookAhead) => {
                    warn!("No lookahead point for state {}, skipping", state.seq)
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Compute and write the steering demand for one state.
    fn tick(
        &mut self,
        state: &CompositeState,
        tick: u64,
        reversing: bool,
    ) -> Result<f64, TrajCtrlError> {
        let geo = state.geo.ok_or(TrajCtrlError::NoLookAhead)?;

        let (lat_error_m, head_error_rad) = if reversing {
            (-geo.lat_error_m, wrap_pi(geo.head_error_rad + std::f64::consts::PI))
        }
        else {
            (geo.lat_error_m, geo.head_error_rad)
        };

        let reference = {
            let nav = self.nav.lock()?;

            let curvature_m = match nav.current_point() {
                Some(p) => parse_curvature(&p.id).unwrap_or_else(|| {
                    trace!("Could not parse curvature from point id {:?}", p.id);
                    0.0
                }),
                None => 0.0,
            };

            self.model.update_a(
                lat_error_m,
                head_error_rad,
                state.vehicle.steer_angle_rad,
                state.speed_ms(),
                curvature_m,
            );

            pfc::reference(tick, &*self.model, &**nav, &self.params)?
        };

        let demand_rad = self.controller.steer(&reference, &*self.model);
        let steer_angle_rad = self.steering.set_steer_angle(demand_rad);

        trace!(
            "Tick {}: lat {:.3} m, head {:.3} rad, steer {:.4} rad",
            tick,
            lat_error_m,
            head_error_rad,
            steer_angle_rad
        );

        if let Some(archive) = self.archive.as_mut() {
            let record = SteerRecord {
                time_s: get_elapsed_seconds(),
                seq: state.seq,
                path_index: state.path_index.unwrap_or_default(),
                tick,
                reversing,
                lat_error_m,
                head_error_rad,
                speed_ms: state.speed_ms(),
                curvature_m: self.model.curvature_m(),
                target_position: reference.target_position,
                look_ahead_m: reference.look_ahead_m,
                ref_x_m: reference.point.x_m,
                ref_y_m: reference.point.y_m,
                ref_heading_rad: reference.point.heading_rad,
                lateral_offset_m: reference.lateral_offset_m,
                steer_angle_rad,
            };

            if let Err(e) = archive.serialise(record) {
                warn!("Steering archive disabled: {}", e);
                self.archive = None;
            }
        }

        Ok(steer_angle_rad)
    }

    /// Brake, hold the brake, then invert the target speed and release.
    fn brake_and_invert(&self, token: &CancelToken) -> Result<(), TrajCtrlError> {
        self.drive.set_throttle(0.0);
        self.drive.set_foot_brake(self.params.brake_level);

        token
            .sleep(Duration::from_millis(self.params.brake_hold_ms))
            .map_err(|e| TrajCtrlError::Wait(e.into()))?;

        let target_kmh = self.demand.negate();
        self.drive.set_foot_brake(0);

        info!("Target speed inverted to {:.2} km/h", target_kmh);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Whether this state ends the epoch started on `path_index`.
fn ends_epoch(state: &CompositeState, path_index: usize) -> bool {
    state.path_changed || state.path_index != Some(path_index)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        info_stream::{Broadcast, WaitError},
        nav::GeoState,
        operation::SharedOperation,
        steer_model::BicycleModel,
        test_support::{sample, StubNavigator},
    };
    use std::{fs::File, thread};

    struct Fixture {
        follower: PathFollower,
        op: SharedOperation,
        demand: SpeedDemand,
        broadcast: Broadcast<Arc<CompositeState>>,
        seq: u64,
    }

    impl Fixture {
        fn new(paths: &[&str]) -> Self {
            let (nav, _) = StubNavigator::with_paths(paths);
            let op = SharedOperation::new();
            let demand = SpeedDemand::new(5.0);
            let params = TrajCtrlParams {
                brake_hold_ms: 20,
                ..Default::default()
            };

            let follower = PathFollower::new(
                params,
                Box::new(BicycleModel::new(2.5, 0.1)),
                nav,
                op.steering_channel(),
                op.drive_channel(),
                demand.clone(),
            );

            Self {
                follower,
                op,
                demand,
                broadcast: Broadcast::new(Duration::from_millis(5)),
                seq: 0,
            }
        }

        fn publish(&mut self, speed_kmh: f64, lat_error_m: f64, path_changed: bool) {
            self.publish_with_heading(speed_kmh, lat_error_m, 0.0, path_changed)
        }

        fn publish_with_heading(
            &mut self,
            speed_kmh: f64,
            lat_error_m: f64,
            head_error_rad: f64,
            path_changed: bool,
        ) {
            let s = sample(speed_kmh);
            self.broadcast.publish(Arc::new(CompositeState {
                seq: self.seq,
                timestamp: s.timestamp,
                is_active: true,
                vehicle: s.vehicle,
                gnss: s.gnss,
                imu: s.imu,
                pose: None,
                geo: Some(GeoState {
                    lat_error_m,
                    head_error_rad,
                }),
                path_index: Some(0),
                path_changed,
            }));
            self.seq += 1;
        }
    }

    #[test]
    fn test_epoch_ends_on_path_change() {
        let mut f = Fixture::new(&["A", "B"]);
        let sub = f.broadcast.subscribe();
        let token = CancelToken::new();

        // Stationary states are skipped, the first moving one starts the epoch
        f.publish(0.0, 0.5, false);
        f.publish(5.0, 0.5, false);
        for _ in 0..3 {
            f.publish(5.0, 0.5, false);
        }

        // Would steer right if it were processed
        f.publish(5.0, -0.5, true);
        f.publish(5.0, -0.5, false);

        let report = f.follower.run_epoch(&sub, &token).unwrap();
        assert_eq!(report.ticks, 3);
        assert_eq!(report.end, EpochEnd::PathChanged);
        assert!(!report.reversing);

        // Last steering demand is from the last tick before the change
        assert!(f.op.snapshot().steer_angle_rad < 0.0);

        // The state after the change is still queued
        assert_eq!(sub.next(&token).unwrap().seq, 6);
    }

    #[test]
    fn test_reverse_epoch_handshake() {
        let mut f = Fixture::new(&["Back"]);
        let sub = f.broadcast.subscribe();
        let token = CancelToken::new();

        // Driving backwards the nose points against the path
        let back = std::f64::consts::PI;

        f.op.drive_channel().set_throttle(0.4);
        f.publish(5.0, 0.0, false);
        f.publish_with_heading(-3.0, 0.5, back, false);
        f.publish_with_heading(-3.0, 0.5, back, false);
        f.publish_with_heading(-3.0, 0.5, back, true);

        let report = f.follower.run_epoch(&sub, &token).unwrap();
        assert!(report.reversing);
        assert_eq!(report.ticks, 2);

        // Inverted twice, brake released, throttle cut
        assert_eq!(f.demand.get(), 5.0);
        assert_eq!(f.op.snapshot().foot_brake, 0);
        assert_eq!(f.op.snapshot().throttle, 0.0);

        // Right of a reverse path, steering right swings the tail back towards it
        assert!(f.op.snapshot().steer_angle_rad > 0.0);
    }

    #[test]
    fn test_steering_settles_as_errors_vanish() {
        let path = std::env::temp_dir().join(format!("steer_settles_{}.csv", std::process::id()));

        let mut f = Fixture::new(&["A"]);
        f.follower = f
            .follower
            .with_archive(Archiver::from_writer(File::create(&path).unwrap()));
        let sub = f.broadcast.subscribe();
        let token = CancelToken::new();

        // Right of the path and pointing slightly left, both errors shrinking to nothing
        f.publish(5.0, 0.8, false);
        for k in 0..=10 {
            let remaining = 1.0 - k as f64 / 10.0;
            f.publish_with_heading(5.0, 0.8 * remaining, -0.1 * remaining, false);
        }
        f.publish(5.0, 0.0, false);
        f.publish(5.0, 0.0, false);
        f.publish(5.0, 0.0, true);

        let report = f.follower.run_epoch(&sub, &token).unwrap();
        assert_eq!(report.ticks, 13);
        drop(f);

        let csv = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let mut lines = csv.lines();
        let col = lines
            .next()
            .unwrap()
            .split(',')
            .position(|h| h == "steer_angle_rad")
            .unwrap();
        let steer: Vec<f64> = lines
            .map(|l| l.split(',').nth(col).unwrap().parse().unwrap())
            .collect();
        assert_eq!(steer.len(), 13);

        // Steers back towards the path while any error remains
        assert!(steer[..10].iter().all(|s| *s < 0.0));
        assert!(steer[9].abs() <= steer[1].abs());

        // On the path and aligned with it the reference is straight ahead
        assert!(steer[10..].iter().all(|s| s.abs() < 1e-9));
    }

    #[test]
    fn test_epoch_cancelled() {
        let mut f = Fixture::new(&["A"]);
        let sub = f.broadcast.subscribe();
        let token = CancelToken::new();

        f.publish(5.0, 0.0, false);

        let t = token.clone();
        let jh = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            t.cancel();
        });

        assert!(matches!(
            f.follower.run_epoch(&sub, &token),
            Err(TrajCtrlError::Wait(WaitError::Cancelled))
        ));
        jh.join().unwrap();
    }

    #[test]
    fn test_epoch_ends_on_completion() {
        let mut f = Fixture::new(&["A"]);
        let sub = f.broadcast.subscribe();

        f.publish(5.0, 0.0, false);
        f.broadcast.complete();

        assert!(matches!(
            f.follower.run_epoch(&sub, &CancelToken::new()),
            Err(TrajCtrlError::Wait(WaitError::Completed))
        ));
    }
}
