//! Test doubles shared by the unit tests of this crate.

use std::{
    sync::{
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use comms_if::eqpt::vehicle::{GnssFix, ImuReading, Operation, TelemetrySample, VehicleTelemetry};
use nalgebra::Vector2;

use crate::{
    fusion::{FusionAdapter, FusionParams, GeoOrigin, HeadingFilterParams},
    nav::{
        GeoState, NavError, Navigator, Route, RoutePath, SharedNavigator, TrajectoryPoint,
        Waypoint,
    },
    params::{AutoPilotConfig, VehExecParams},
    steer_model::SteerModelParams,
    traj_ctrl::TrajCtrlParams,
    transport::{ActuationSink, Resource, TelemetrySource, Transport, TransportError},
};

// ------------------------------------------------------------------------------------------------
// TELEMETRY
// ------------------------------------------------------------------------------------------------

/// A telemetry source fed from a channel. Dropping the sender closes the source.
pub struct ChannelSource {
    receiver: Mutex<Receiver<TelemetrySample>>,
}

impl ChannelSource {
    pub fn new() -> (Self, Sender<TelemetrySample>) {
        let (tx, rx) = channel();
        (
            Self {
                receiver: Mutex::new(rx),
            },
            tx,
        )
    }
}

impl TelemetrySource for ChannelSource {
    fn recv_sample(&self, timeout: Duration) -> Result<Option<TelemetrySample>, TransportError> {
        match self.receiver.lock()?.recv_timeout(timeout) {
            Ok(s) => Ok(Some(s)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

/// A valid sample at the origin, heading north, at the given speed.
pub fn sample(speed_kmh: f64) -> TelemetrySample {
    sample_at(speed_kmh, Utc::now())
}

pub fn sample_at(speed_kmh: f64, timestamp: DateTime<Utc>) -> TelemetrySample {
    TelemetrySample {
        timestamp,
        vehicle: VehicleTelemetry {
            speed_kmh,
            ..Default::default()
        },
        gnss: GnssFix::default(),
        imu: ImuReading::default(),
    }
}

/// A sample whose fix cannot be fused.
pub fn bad_sample() -> TelemetrySample {
    let mut s = sample(0.0);
    s.gnss.latitude_deg = f64::NAN;
    s
}

/// A fusion adapter with no antenna offset and the origin at 0° N 0° E.
pub fn fusion() -> FusionAdapter {
    FusionAdapter::new(&fusion_params())
}

fn fusion_params() -> FusionParams {
    FusionParams {
        antenna_offset_m: 0.0,
        origin: Some(GeoOrigin {
            latitude_deg: 0.0,
            longitude_deg: 0.0,
        }),
        heading_filter: HeadingFilterParams::Raw,
    }
}

/// An auto pilot configuration running fast enough for tests.
pub fn config() -> AutoPilotConfig {
    AutoPilotConfig {
        exec: VehExecParams {
            sample_rate_hz: 200.0,
            actuation_rate_hz: 200.0,
            ..Default::default()
        },
        fusion: fusion_params(),
        speed_ctrl: Default::default(),
        traj_ctrl: TrajCtrlParams {
            brake_hold_ms: 20,
            ..Default::default()
        },
        steer_model: SteerModelParams::Bicycle {
            wheelbase_m: 2.7,
            dt_s: 0.005,
        },
    }
}

// ------------------------------------------------------------------------------------------------
// ACTUATION AND RESOURCES
// ------------------------------------------------------------------------------------------------

/// A sink recording every operation sent to it.
#[derive(Default)]
pub struct RecordingSink {
    ops: Mutex<Vec<Operation>>,
}

impl RecordingSink {
    pub fn operations(&self) -> Vec<Operation> {
        self.ops.lock().unwrap().clone()
    }
}

impl ActuationSink for RecordingSink {
    fn send_operation(&self, operation: &Operation) -> Result<(), TransportError> {
        self.ops.lock()?.push(*operation);
        Ok(())
    }
}

/// A resource which logs its name into a shared list when released.
pub struct LoggedResource {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl LoggedResource {
    pub fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
        }
    }
}

impl Resource for LoggedResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&self) -> Result<(), TransportError> {
        self.log.lock()?.push(self.name.clone());
        Ok(())
    }
}

/// Everything needed to drive a transport from a test.
pub struct TestTransport {
    pub transport: Transport,
    pub samples: Sender<TelemetrySample>,
    pub sink: Arc<RecordingSink>,
    pub released: Arc<Mutex<Vec<String>>>,
}

impl TestTransport {
    pub fn new() -> Self {
        let (source, samples) = ChannelSource::new();
        let sink = Arc::new(RecordingSink::default());
        let released = Arc::new(Mutex::new(Vec::new()));

        let transport = Transport {
            source: Arc::new(source),
            sink: sink.clone(),
            resources: vec![
                Arc::new(LoggedResource::new("connector", &released)),
                Arc::new(LoggedResource::new("client", &released)),
                Arc::new(LoggedResource::new("process", &released)),
            ],
        };

        Self {
            transport,
            samples,
            sink,
            released,
        }
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

// ------------------------------------------------------------------------------------------------
// NAVIGATION
// ------------------------------------------------------------------------------------------------

pub enum StubCmd {
    SetGeo(GeoState),
    NextPath,
    SetPointId(String),
}

/// A navigator scripted from the test through a [`StubHandle`].
///
/// Commands are applied at the start of the next `update`, so a command sent before a sample is
/// seen by the state produced from that sample. Lookahead points are always straight ahead.
pub struct StubNavigator {
    cmds: Receiver<StubCmd>,
    geo: GeoState,
    paths: Vec<RoutePath>,
    path_index: usize,
    changed: bool,
    finished: bool,
    point: Waypoint,
}

#[derive(Clone)]
pub struct StubHandle {
    tx: Sender<StubCmd>,
}

impl StubNavigator {
    /// A navigator with a single forward path.
    pub fn shared() -> (SharedNavigator, StubHandle) {
        Self::with_paths(&["Forward"])
    }

    /// A navigator with paths of the given names. Names containing `Back` are reverse paths.
    pub fn with_paths(names: &[&str]) -> (SharedNavigator, StubHandle) {
        let (tx, rx) = channel();

        let nav = Self {
            cmds: rx,
            geo: GeoState::default(),
            paths: names.iter().map(|n| stub_path(n)).collect(),
            path_index: 0,
            changed: false,
            finished: false,
            point: Waypoint {
                id: "0.0".into(),
                position_m: Vector2::zeros(),
            },
        };

        (Arc::new(Mutex::new(Box::new(nav))), StubHandle { tx })
    }
}

impl StubHandle {
    pub fn set_geo(&self, lat_error_m: f64, head_error_rad: f64) {
        self.send(StubCmd::SetGeo(GeoState {
            lat_error_m,
            head_error_rad,
        }))
    }

    pub fn next_path(&self) {
        self.send(StubCmd::NextPath)
    }

    pub fn set_point_id(&self, id: &str) {
        self.send(StubCmd::SetPointId(id.into()))
    }

    fn send(&self, cmd: StubCmd) {
        // The navigator may already be gone at the end of a test
        self.tx.send(cmd).ok();
    }
}

impl Navigator for StubNavigator {
    fn set_map(&mut self, route: Route) -> Result<(), NavError> {
        route.validate()?;
        self.paths = route.paths;
        self.path_index = 0;
        self.finished = false;
        Ok(())
    }

    fn has_map(&self) -> bool {
        !self.paths.is_empty()
    }

    fn update(&mut self, _: Vector2<f64>, _: f64) -> Option<GeoState> {
        while let Ok(cmd) = self.cmds.try_recv() {
            match cmd {
                StubCmd::SetGeo(g) => self.geo = g,
                StubCmd::NextPath => {
                    self.changed = true;
                    if self.path_index + 1 < self.paths.len() {
                        self.path_index += 1;
                    }
                    else {
                        self.finished = true;
                    }
                }
                StubCmd::SetPointId(id) => self.point.id = id,
            }
        }

        Some(self.geo)
    }

    fn current_path(&self) -> Option<&RoutePath> {
        self.paths.get(self.path_index)
    }

    fn next_path(&self) -> Option<&RoutePath> {
        self.paths.get(self.path_index + 1)
    }

    fn current_point(&self) -> Option<&Waypoint> {
        Some(&self.point)
    }

    fn current_path_index(&self) -> Option<usize> {
        self.current_path().map(|_| self.path_index)
    }

    fn take_path_changed(&mut self) -> bool {
        std::mem::replace(&mut self.changed, false)
    }

    fn look_ahead_point(&self, distance_m: f64, _: bool) -> Option<TrajectoryPoint> {
        Some(TrajectoryPoint {
            y_m: distance_m,
            ..Default::default()
        })
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

fn stub_path(name: &str) -> RoutePath {
    RoutePath {
        name: name.into(),
        is_back: false,
        points: vec![
            Waypoint {
                id: "0.0".into(),
                position_m: Vector2::new(0.0, 0.0),
            },
            Waypoint {
                id: "0.0".into(),
                position_m: Vector2::new(0.0, 100.0),
            },
        ],
    }
}
