//! # Auto pilot
//!
//! The [`AutoPilot`] owns every loop of the control core and their lifecycle:
//!
//! - The information stream and actuation loop run from construction until disposal.
//! - [`AutoPilot::start`] creates a new cancellation scope and spawns the speed loop and the
//!   control loop, which runs path following epochs in route order.
//! - [`AutoPilot::stop`] brakes, waits for the vehicle to stand still, then cancels the scope and
//!   joins both loops.
//! - [`AutoPilot::dispose`] stops, shuts down the stream and actuation, and releases the transport.
//!
//! If the information stream terminates (sensing lost or the transport failed) the non-blocking
//! part of disposal runs immediately from the stream thread: the scope is cancelled, the brake is
//! applied and sent, actuation is told to stop and the transport is released. Disposal happens
//! exactly once whichever way it is triggered.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
};

use comms_if::eqpt::vehicle::Operation;
use log::{error, info, warn};
use util::{archive::Archiver, cancel::CancelToken, session::Session, time::period_from_hz};

use crate::{
    actuation::{ActuationError, ActuationLoop},
    fusion::FusionAdapter,
    info_stream::{
        CompositeState, InfoStream, InfoStreamError, InfoStreamParams, Subscription, Termination,
        WaitError,
    },
    nav::{NavError, Route, SharedNavigator},
    operation::{SharedOperation, SpeedDemand},
    params::AutoPilotConfig,
    speed_ctrl::SpeedController,
    traj_ctrl::{EpochEnd, PathFollower, TrajCtrlError},
    transport::Transport,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The control core of the vehicle.
pub struct AutoPilot {
    core: Arc<Core>,
    stream: InfoStream,
    nav: SharedNavigator,
    config: AutoPilotConfig,

    /// Automatic steering flag, read by the information stream
    auto_steering: Arc<AtomicBool>,

    /// The path follower, while the control loop isn't running
    follower: Option<PathFollower>,

    /// The current run, between `start` and `stop`
    scope: Option<RunScope>,
}

/// State shared with the information stream's termination callback.
struct Core {
    operation: SharedOperation,
    demand: SpeedDemand,
    actuation: Mutex<ActuationLoop>,
    transport: Transport,

    /// Tokens of the current run, cancelled on termination
    tokens: Mutex<Vec<CancelToken>>,
    disposed: AtomicBool,
    brake_level: i32,
}

struct RunScope {
    token: CancelToken,

    /// Ends the control loop on its own, so `stop` can end it before braking
    control_token: CancelToken,

    speed_jh: Option<JoinHandle<WaitError>>,
    control_jh: Option<JoinHandle<PathFollower>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AutoPilotError {
    #[error("The auto pilot is already running")]
    AlreadyRunning,

    #[error("The information stream has completed")]
    StreamCompleted,

    #[error("The auto pilot has been disposed")]
    Disposed,

    #[error("The map path is empty")]
    EmptyMapPath,

    #[error("Could not load the map: {0}")]
    MapError(#[from] NavError),

    #[error("Could not start the information stream: {0}")]
    InfoStreamError(#[from] InfoStreamError),

    #[error("Could not start actuation: {0}")]
    ActuationError(#[from] ActuationError),

    #[error("Could not create the steering archive: {0}")]
    ArchiveError(#[from] util::archive::ArchiveError),

    #[error("Could not spawn the {0} thread: {1}")]
    SpawnError(&'static str, std::io::Error),

    #[error("The {0} thread panicked")]
    ThreadPanicked(&'static str),

    #[error("A lock is poisoned")]
    PoisonError,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl AutoPilot {
    /// Build the control core on top of a connected transport.
    ///
    /// The information stream and actuation loop start immediately. If a session is given and
    /// steering archiving is enabled every steering tick is recorded into it.
    pub fn new(
        transport: Transport,
        nav: SharedNavigator,
        config: AutoPilotConfig,
        session: Option<&Session>,
    ) -> Result<Self, AutoPilotError> {
        let operation = SharedOperation::new();
        let demand = SpeedDemand::new(0.0);
        let auto_steering = Arc::new(AtomicBool::new(true));

        let actuation = ActuationLoop::start(
            transport.sink.clone(),
            operation.clone(),
            period_from_hz(config.exec.actuation_rate_hz),
        )?;

        let core = Arc::new(Core {
            operation,
            demand,
            actuation: Mutex::new(actuation),
            transport: transport.clone(),
            tokens: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            brake_level: config.exec.brake_level,
        });

        let stream = {
            let core = core.clone();
            InfoStream::start(
                transport.source.clone(),
                FusionAdapter::new(&config.fusion),
                nav.clone(),
                auto_steering.clone(),
                InfoStreamParams {
                    sample_period: period_from_hz(config.exec.sample_rate_hz),
                },
                Box::new(move |cause| {
                    match cause {
                        Termination::SensingLost => error!("Sensing lost, shutting down"),
                        Termination::TransportError(e) => {
                            error!("Transport failed, shutting down: {}", e)
                        }
                    }
                    core.terminate();
                }),
            )?
        };

        let mut follower = PathFollower::new(
            config.traj_ctrl.clone(),
            config.steer_model.build(),
            nav.clone(),
            core.operation.steering_channel(),
            core.operation.drive_channel(),
            core.demand.clone(),
        );

        if let Some(session) = session {
            if config.exec.archive_steering {
                follower = follower.with_archive(Archiver::from_path(
                    session,
                    "traj_ctrl/steer.csv",
                )?);
            }
        }

        Ok(Self {
            core,
            stream,
            nav,
            config,
            auto_steering,
            follower: Some(follower),
            scope: None,
        })
    }

    /// Start the speed and control loops.
    pub fn start(&mut self) -> Result<(), AutoPilotError> {
        if self.core.disposed.load(Ordering::SeqCst) {
            return Err(AutoPilotError::Disposed);
        }

        match self.scope {
            Some(ref s) if !s.token.is_cancelled() => return Err(AutoPilotError::AlreadyRunning),
            Some(_) => self.join_scope()?,
            None => (),
        }

        if self.stream.is_completed() {
            return Err(AutoPilotError::StreamCompleted);
        }

        let token = CancelToken::new();
        let control_token = CancelToken::new();
        *self.core.tokens()? = vec![token.clone(), control_token.clone()];

        self.core.operation.reset();

        let speed_jh = {
            let ctrl = SpeedController::new(
                &self.config.speed_ctrl,
                self.core.operation.drive_channel(),
                self.core.demand.clone(),
            );
            let sub = self.stream.subscribe();
            let token = token.clone();

            thread::Builder::new()
                .name("speed_ctrl".into())
                .spawn(move || ctrl.run(sub, &token))
                .map_err(|e| AutoPilotError::SpawnError("speed_ctrl", e))?
        };

        let mut follower = self.follower.take().ok_or(AutoPilotError::AlreadyRunning)?;
        let control_jh = {
            let sub = self.stream.subscribe();
            let token = control_token.clone();

            thread::Builder::new()
                .name("traj_ctrl".into())
                .spawn(move || {
                    control_loop(&mut follower, &sub, &token);
                    follower
                })
                .map_err(|e| AutoPilotError::SpawnError("traj_ctrl", e))?
        };

        self.scope = Some(RunScope {
            token,
            control_token,
            speed_jh: Some(speed_jh),
            control_jh: Some(control_jh),
        });

        info!("Auto pilot started");

        Ok(())
    }

    /// Brake, wait for the vehicle to stop, then stop the loops.
    ///
    /// Does nothing if the loops are not running or have already been cancelled.
    pub fn stop(&mut self) -> Result<(), AutoPilotError> {
        let (token, control_token) = match self.scope {
            Some(ref s) => (s.token.clone(), s.control_token.clone()),
            None => return Ok(()),
        };

        if token.is_cancelled() {
            return self.join_scope();
        }

        info!("Stopping, braking to a standstill");

        // End the control loop first, an epoch part way through a reverse handshake would
        // otherwise release the brake
        control_token.cancel();
        self.join_control()?;

        // Subscribe before braking so the state showing the stop is never missed
        let sub = self.stream.subscribe();
        self.core.brake();

        let threshold_kmh = self.config.exec.stop_threshold_kmh;
        match sub.wait_for(&token, |s| s.speed_kmh().abs() < threshold_kmh) {
            Ok(s) => info!("Vehicle stopped at {:.3} km/h", s.speed_kmh()),
            Err(e) => warn!("Stopped waiting for standstill: {}", e),
        }

        token.cancel();
        self.join_scope()
    }

    /// Wait for the control loop to finish, which happens when the route is complete, automatic
    /// steering is disabled or the stream completes. The speed loop keeps running until `stop`.
    pub fn wait(&mut self) -> Result<(), AutoPilotError> {
        self.join_control()
    }

    /// Stop, shut everything down and release the transport. Safe to call more than once.
    pub fn dispose(&mut self) -> Result<(), AutoPilotError> {
        let stop_result = self.stop();

        self.stream.shutdown();
        self.core.actuation()?.stop();

        if !self.core.disposed.swap(true, Ordering::SeqCst) {
            info!("Releasing the transport");
            self.core.transport.release_all();
        }

        stop_result
    }

    /// Set the target speed and release the foot brake.
    pub fn set_vehicle_speed(&self, speed_kmh: f64) {
        self.core.demand.set(speed_kmh);
        self.core.operation.drive_channel().set_foot_brake(0);
        info!("Target speed set to {:.2} km/h", speed_kmh);
    }

    /// Set the steering angle directly, returning the (saturated) angle written.
    pub fn set_steering_angle(&self, angle_rad: f64) -> f64 {
        self.core.operation.steering_channel().set_steer_angle(angle_rad)
    }

    /// Load a route from a file and give it to the navigator.
    pub fn set_map<P: AsRef<Path>>(&self, path: P) -> Result<(), AutoPilotError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(AutoPilotError::EmptyMapPath);
        }

        let route = Route::load(path)?;
        info!("Loaded route {:?} with {} paths", path, route.paths.len());

        self.nav
            .lock()
            .map_err(|_| AutoPilotError::PoisonError)?
            .set_map(route)?;

        Ok(())
    }

    /// Enable or disable automatic steering.
    pub fn set_auto_steering(&self, enabled: bool) {
        self.auto_steering.store(enabled, Ordering::SeqCst);
        info!("Automatic steering {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Subscribe to the states produced from now on.
    pub fn subscribe(&self) -> Subscription<Arc<CompositeState>> {
        self.stream.subscribe()
    }

    pub fn operation(&self) -> Operation {
        self.core.operation.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.scope
            .as_ref()
            .map(|s| !s.token.is_cancelled())
            .unwrap_or(false)
    }

    /// Cancel the current scope and join its threads.
    fn join_scope(&mut self) -> Result<(), AutoPilotError> {
        match self.scope {
            Some(ref s) => {
                s.control_token.cancel();
                s.token.cancel();
            }
            None => return Ok(()),
        }

        let control_result = self.join_control();

        let mut speed_result = Ok(());
        if let Some(jh) = self.scope.take().and_then(|mut s| s.speed_jh.take()) {
            if jh.join().is_err() {
                speed_result = Err(AutoPilotError::ThreadPanicked("speed_ctrl"));
            }
        }

        info!("Auto pilot stopped");

        control_result.and(speed_result)
    }

    /// Join the control loop, which must be finished or finishing, and take back the follower.
    fn join_control(&mut self) -> Result<(), AutoPilotError> {
        let jh = match self.scope.as_mut().and_then(|s| s.control_jh.take()) {
            Some(jh) => jh,
            None => return Ok(()),
        };

        let follower = jh
            .join()
            .map_err(|_| AutoPilotError::ThreadPanicked("traj_ctrl"))?;
        self.follower = Some(follower);

        Ok(())
    }
}

impl Core {
    fn tokens(&self) -> Result<MutexGuard<Vec<CancelToken>>, AutoPilotError> {
        self.tokens.lock().map_err(|_| AutoPilotError::PoisonError)
    }

    fn actuation(&self) -> Result<MutexGuard<ActuationLoop>, AutoPilotError> {
        self.actuation.lock().map_err(|_| AutoPilotError::PoisonError)
    }

    /// Cut the throttle, apply the brake and send it straight away.
    fn brake(&self) {
        let drive = self.operation.drive_channel();
        drive.set_throttle(0.0);
        drive.set_foot_brake(self.brake_level);

        match self.actuation() {
            Ok(a) => a.flush(),
            Err(e) => warn!("Could not flush the brake: {}", e),
        }
    }

    /// Non-blocking disposal, run from the stream thread when the stream terminates.
    fn terminate(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.tokens() {
            Ok(tokens) => tokens.iter().for_each(|t| {
                t.cancel();
            }),
            Err(e) => warn!("Could not cancel the control loops: {}", e),
        }

        self.brake();

        match self.actuation() {
            Ok(a) => a.signal_stop(),
            Err(e) => warn!("Could not stop actuation: {}", e),
        }

        self.transport.release_all();
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Run epochs until the route is complete or the loop is told to stop.
fn control_loop(
    follower: &mut PathFollower,
    sub: &Subscription<Arc<CompositeState>>,
    token: &CancelToken,
) {
    info!("Control loop started");

    loop {
        match follower.route_finished() {
            Ok(false) => (),
            Ok(true) => {
                info!("Route complete");
                break;
            }
            Err(e) => {
                error!("Control loop failed: {}", e);
                break;
            }
        }

        match follower.run_epoch(sub, token) {
            Ok(r) if r.end == EpochEnd::PathChanged => continue,
            Ok(r) => {
                info!("Control loop finished: {:?}", r.end);
                break;
            }
            Err(TrajCtrlError::Wait(e)) => {
                info!("Control loop stopped: {}", e);
                break;
            }
            Err(TrajCtrlError::NoActivePath) => {
                warn!("No path to follow, set a map before starting");
                break;
            }
            Err(e) => {
                error!("Control loop failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        nav::{self, RouteNavigator},
        test_support::{bad_sample, config, sample, StubNavigator, TestTransport},
    };
    use std::{
        sync::atomic::AtomicBool,
        time::{Duration, Instant},
    };

    /// Keep feeding samples at the given speed until told to stop.
    fn feed(
        t: &TestTransport,
        speed: impl Fn(Duration) -> f64 + Send + 'static,
    ) -> (Arc<AtomicBool>, JoinHandle<()>) {
        let run = Arc::new(AtomicBool::new(true));
        let samples = t.samples.clone();

        let r = run.clone();
        let jh = thread::spawn(move || {
            let start = Instant::now();
            while r.load(Ordering::SeqCst) {
                if samples.send(sample(speed(start.elapsed()))).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
        });

        (run, jh)
    }

    #[test]
    fn test_stop_waits_for_standstill() {
        let t = TestTransport::new();
        let (nav, _) = StubNavigator::shared();
        let mut ap = AutoPilot::new(t.transport.clone(), nav, config(), None).unwrap();

        ap.set_vehicle_speed(5.0);
        ap.start().unwrap();
        assert!(ap.is_running());
        assert!(matches!(ap.start(), Err(AutoPilotError::AlreadyRunning)));

        let slowed = Arc::new(AtomicBool::new(false));
        let s = slowed.clone();
        let (run, feeder) = feed(&t, move |elapsed| {
            if elapsed < Duration::from_millis(150) {
                5.0
            }
            else {
                s.store(true, Ordering::SeqCst);
                0.05
            }
        });

        thread::sleep(Duration::from_millis(30));
        ap.stop().unwrap();

        assert!(slowed.load(Ordering::SeqCst));
        assert!(!ap.is_running());
        assert_eq!(ap.operation().foot_brake, 2);

        // A second stop does nothing
        ap.stop().unwrap();

        // And the pilot can be restarted
        ap.start().unwrap();
        ap.stop().unwrap();

        ap.dispose().unwrap();
        run.store(false, Ordering::SeqCst);
        feeder.join().unwrap();
    }

    #[test]
    fn test_dispose_releases_in_order_once() {
        let t = TestTransport::new();
        let (nav, _) = StubNavigator::shared();
        let mut ap = AutoPilot::new(t.transport.clone(), nav, config(), None).unwrap();

        let (run, feeder) = feed(&t, |_| 0.0);

        ap.start().unwrap();
        ap.dispose().unwrap();
        ap.dispose().unwrap();

        assert_eq!(t.released(), vec!["connector", "client", "process"]);
        assert!(matches!(ap.start(), Err(AutoPilotError::Disposed)));

        // The brake was the last thing sent
        let ops = t.sink.operations();
        assert_eq!(ops.last().map(|o| o.foot_brake), Some(2));

        run.store(false, Ordering::SeqCst);
        feeder.join().unwrap();
    }

    #[test]
    fn test_sensing_loss_disposes_once() {
        let t = TestTransport::new();
        let (nav, _) = StubNavigator::shared();
        let mut ap = AutoPilot::new(t.transport.clone(), nav, config(), None).unwrap();

        ap.set_vehicle_speed(5.0);
        ap.start().unwrap();

        t.samples.send(sample(5.0)).unwrap();
        t.samples.send(bad_sample()).unwrap();

        let start = Instant::now();
        while t.released().len() < 3 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(t.released(), vec!["connector", "client", "process"]);
        assert!(!ap.is_running());
        assert_eq!(ap.operation().foot_brake, 2);
        assert!(ap.start().is_err());

        // Stop only joins the cancelled loops, dispose releases nothing more
        ap.stop().unwrap();
        ap.dispose().unwrap();
        assert_eq!(t.released().len(), 3);
    }

    #[test]
    fn test_set_map() {
        let t = TestTransport::new();
        let (nav, _) = StubNavigator::shared();
        let mut ap = AutoPilot::new(t.transport.clone(), nav, config(), None).unwrap();

        assert!(matches!(ap.set_map(""), Err(AutoPilotError::EmptyMapPath)));
        assert!(matches!(
            ap.set_map("/does/not/exist.json"),
            Err(AutoPilotError::MapError(NavError::RouteFileError(_)))
        ));

        let route = Path::new(env!("CARGO_MANIFEST_DIR")).join("../routes/sample_route.json");
        ap.set_map(&route).unwrap();

        assert_eq!(ap.set_steering_angle(1.0), crate::operation::MAX_STEER_ANGLE_RAD);

        ap.dispose().unwrap();
    }

    #[test]
    fn test_samples_before_map_are_dropped() {
        let t = TestTransport::new();

        // The simulator streams as soon as it is connected, before any route is loaded
        t.samples.send(sample(0.0)).unwrap();
        let mut ap = AutoPilot::new(
            t.transport.clone(),
            nav::shared(RouteNavigator::new()),
            config(),
            None,
        )
        .unwrap();
        let sub = ap.subscribe();

        thread::sleep(Duration::from_millis(50));
        t.samples.send(sample(0.0)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(t.released().is_empty());

        let route = Path::new(env!("CARGO_MANIFEST_DIR")).join("../routes/sample_route.json");
        ap.set_map(&route).unwrap();
        t.samples.send(sample(0.0)).unwrap();

        // Dropped samples do not count towards the sequence
        let state = sub.next(&CancelToken::new()).unwrap();
        assert_eq!(state.seq, 0);
        assert!(state.geo.is_some());

        let (run, feeder) = feed(&t, |_| 0.0);
        ap.start().unwrap();
        assert!(ap.is_running());
        assert!(t.released().is_empty());

        ap.dispose().unwrap();
        assert_eq!(t.released(), vec!["connector", "client", "process"]);

        run.store(false, Ordering::SeqCst);
        feeder.join().unwrap();
    }

    #[test]
    fn test_stop_during_reverse_handshake_keeps_brake() {
        let t = TestTransport::new();
        let (nav, _) = StubNavigator::with_paths(&["Back"]);
        let mut cfg = config();
        cfg.traj_ctrl.brake_hold_ms = 200;
        let mut ap = AutoPilot::new(t.transport.clone(), nav, cfg, None).unwrap();

        ap.set_vehicle_speed(5.0);
        ap.start().unwrap();

        // Still moving when the hold would have ended
        let (run, feeder) = feed(&t, |elapsed| {
            if elapsed < Duration::from_millis(400) {
                5.0
            }
            else {
                0.0
            }
        });

        // Part way through the hold
        thread::sleep(Duration::from_millis(60));
        ap.stop().unwrap();

        // Once braking starts the brake is never released
        let ops = t.sink.operations();
        let first = ops.iter().position(|o| o.foot_brake > 0).unwrap();
        assert!(ops[first..].iter().all(|o| o.foot_brake == 2));
        assert_eq!(ap.operation().foot_brake, 2);

        ap.dispose().unwrap();
        run.store(false, Ordering::SeqCst);
        feeder.join().unwrap();
    }

    #[test]
    fn test_route_completion_ends_control_loop() {
        let t = TestTransport::new();
        let (nav, handle) = StubNavigator::with_paths(&["A", "B"]);
        let mut ap = AutoPilot::new(t.transport.clone(), nav, config(), None).unwrap();

        ap.set_vehicle_speed(5.0);
        ap.start().unwrap();

        let (run, feeder) = feed(&t, |_| 5.0);

        // Finish both paths
        thread::sleep(Duration::from_millis(30));
        handle.next_path();
        thread::sleep(Duration::from_millis(30));
        handle.next_path();

        ap.wait().unwrap();
        assert!(ap.is_running());

        run.store(false, Ordering::SeqCst);
        feeder.join().unwrap();

        // Stop still brakes and waits for the standstill
        let (run, feeder) = feed(&t, |_| 0.0);
        ap.stop().unwrap();
        ap.dispose().unwrap();
        run.store(false, Ordering::SeqCst);
        feeder.join().unwrap();
    }

    #[test]
    fn test_disabling_auto_steering_ends_control_loop() {
        let t = TestTransport::new();
        let (nav, _) = StubNavigator::shared();
        let mut ap = AutoPilot::new(t.transport.clone(), nav, config(), None).unwrap();

        ap.set_vehicle_speed(5.0);
        ap.start().unwrap();

        let (run, feeder) = feed(&t, |_| 5.0);

        thread::sleep(Duration::from_millis(30));
        ap.set_auto_steering(false);
        ap.wait().unwrap();

        // Speed control carries on until stopped
        assert!(ap.is_running());

        run.store(false, Ordering::SeqCst);
        feeder.join().unwrap();

        let (run, feeder) = feed(&t, |_| 0.0);
        ap.stop().unwrap();
        ap.dispose().unwrap();
        run.store(false, Ordering::SeqCst);
        feeder.join().unwrap();
    }
}
