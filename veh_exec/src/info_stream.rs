//! # Information stream
//!
//! The information stream turns every telemetry sample into a [`CompositeState`] and multicasts
//! it to every subscriber. States are produced one at a time on a single background thread:
//!
//! 1. Wait for the next sample from the transport.
//! 2. Fuse the sample into a pose.
//! 3. Update the navigator with the pose to get the [`GeoState`].
//! 4. Publish the state.
//!
//! Subscribers only see states published after they subscribed. If a state has no `GeoState`
//! (sensing has been lost) it is not published: the stream completes, which every subscriber
//! observes as [`WaitError::Completed`], and the termination callback is called. This is a one
//! way transition, a completed stream never produces again.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Utc};
use comms_if::eqpt::vehicle::{GnssFix, ImuReading, TelemetrySample, VehicleTelemetry};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use util::cancel::{CancelToken, Cancelled};

use crate::{
    fusion::{FusedPose, FusionAdapter, KMH_TO_MS},
    nav::{GeoState, SharedNavigator},
    transport::{TelemetrySource, TransportError},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// One fused snapshot of the vehicle, produced once per sample.
#[derive(Debug, Clone, Serialize)]
pub struct CompositeState {
    /// Sequence number of the state, starting at 0
    pub seq: u64,

    /// Time the underlying sample was taken
    pub timestamp: DateTime<Utc>,

    /// Whether automatic steering was enabled when the state was produced
    pub is_active: bool,

    pub vehicle: VehicleTelemetry,
    pub gnss: GnssFix,
    pub imu: ImuReading,

    pub pose: Option<FusedPose>,
    pub geo: Option<GeoState>,

    /// Index of the navigator's current path after this state's update
    pub path_index: Option<usize>,

    /// Set if the navigator moved onto a new path during this state's update
    pub path_changed: bool,
}

/// A multicast channel with an explicit completed state.
pub struct Broadcast<T> {
    inner: Mutex<BroadcastInner<T>>,
    poll_period: Duration,
}

struct BroadcastInner<T> {
    subscribers: Vec<Sender<T>>,
    completed: bool,
}

/// A subscription to a [`Broadcast`]. Dropping the subscription unsubscribes.
pub struct Subscription<T> {
    receiver: Receiver<T>,
    poll_period: Duration,
}

/// Parameters of the information stream.
#[derive(Debug, Clone, Copy)]
pub struct InfoStreamParams {
    /// Expected period between samples. Blocking waits poll at this period.
    pub sample_period: Duration,
}

/// Handle to the running information stream.
pub struct InfoStream {
    broadcast: Arc<Broadcast<Arc<CompositeState>>>,
    run: Arc<AtomicBool>,
    jh: Option<JoinHandle<()>>,
}

/// Everything the producer thread owns.
struct Producer {
    source: Arc<dyn TelemetrySource>,
    fusion: FusionAdapter,
    nav: SharedNavigator,
    is_active: Arc<AtomicBool>,
    broadcast: Arc<Broadcast<Arc<CompositeState>>>,
    run: Arc<AtomicBool>,
    sample_period: Duration,
    on_terminate: Option<Box<dyn FnOnce(Termination) + Send>>,
    seq: u64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Outcome of turning one sample into a state.
enum Produced {
    State(CompositeState),

    /// The navigator has no map yet, the sample is dropped
    NoMap,

    /// The navigator is unusable and the stream has been terminated
    Failed,
}

/// Reasons a blocking wait on a subscription returns without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("The wait was cancelled")]
    Cancelled,

    #[error("The stream has completed")]
    Completed,
}

/// Why the stream terminated.
#[derive(Debug)]
pub enum Termination {
    /// A sample produced no GeoState
    SensingLost,

    /// The transport failed
    TransportError(TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum InfoStreamError {
    #[error("Could not spawn the stream thread: {0}")]
    SpawnError(std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CompositeState {
    pub fn speed_kmh(&self) -> f64 {
        self.vehicle.speed_kmh
    }

    pub fn speed_ms(&self) -> f64 {
        self.vehicle.speed_kmh * KMH_TO_MS
    }
}

impl<T: Clone> Broadcast<T> {
    /// Create a new broadcast whose subscribers poll for cancellation at the given period.
    pub fn new(poll_period: Duration) -> Self {
        Self {
            inner: Mutex::new(BroadcastInner {
                subscribers: Vec::new(),
                completed: false,
            }),
            poll_period: poll_period.max(Duration::from_millis(1)),
        }
    }

    fn lock(&self) -> MutexGuard<BroadcastInner<T>> {
        // The inner state is always left consistent, so a poisoned lock is still usable
        match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Subscribe to items published from now on.
    ///
    /// Subscribing to a completed broadcast gives a subscription which is already completed.
    pub fn subscribe(&self) -> Subscription<T> {
        let (sender, receiver) = channel();

        let mut inner = self.lock();
        if !inner.completed {
            inner.subscribers.push(sender);
        }

        Subscription {
            receiver,
            poll_period: self.poll_period,
        }
    }

    /// Publish an item to all current subscribers, returning how many received it.
    ///
    /// Dropped subscriptions are removed. Publishing to a completed broadcast does nothing.
    pub fn publish(&self, item: T) -> usize {
        let mut inner = self.lock();
        if inner.completed {
            return 0;
        }

        inner.subscribers.retain(|s| s.send(item.clone()).is_ok());
        inner.subscribers.len()
    }

    /// Complete the broadcast. Returns `true` only for the call which completed it.
    pub fn complete(&self) -> bool {
        let mut inner = self.lock();
        if inner.completed {
            return false;
        }

        inner.completed = true;

        // Dropping the senders disconnects every subscriber once it has drained its queue
        inner.subscribers.clear();

        true
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }
}

impl<T> Subscription<T> {
    /// Wait for the next item.
    pub fn next(&self, token: &CancelToken) -> Result<T, WaitError> {
        loop {
            token.check()?;

            match self.receiver.recv_timeout(self.poll_period) {
                Ok(item) => return Ok(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(WaitError::Completed),
            }
        }
    }

    /// Wait for the next item matching the predicate, discarding the others.
    pub fn wait_for<F>(&self, token: &CancelToken, mut pred: F) -> Result<T, WaitError>
    where
        F: FnMut(&T) -> bool,
    {
        loop {
            let item = self.next(token)?;
            if pred(&item) {
                return Ok(item);
            }
        }
    }
}

impl InfoStream {
    /// Start producing states.
    ///
    /// `on_terminate` is called once, from the stream thread, if the stream terminates itself
    /// (sensing lost or transport failure). It is not called when the stream is shut down with
    /// [`InfoStream::shutdown`].
    pub fn start(
        source: Arc<dyn TelemetrySource>,
        fusion: FusionAdapter,
        nav: SharedNavigator,
        is_active: Arc<AtomicBool>,
        params: InfoStreamParams,
        on_terminate: Box<dyn FnOnce(Termination) + Send>,
    ) -> Result<Self, InfoStreamError> {
        let broadcast = Arc::new(Broadcast::new(params.sample_period));
        let run = Arc::new(AtomicBool::new(true));

        let producer = Producer {
            source,
            fusion,
            nav,
            is_active,
            broadcast: broadcast.clone(),
            run: run.clone(),
            sample_period: params.sample_period,
            on_terminate: Some(on_terminate),
            seq: 0,
        };

        let jh = thread::Builder::new()
            .name("info_stream".into())
            .spawn(move || producer.run())
            .map_err(InfoStreamError::SpawnError)?;

        Ok(Self {
            broadcast,
            run,
            jh: Some(jh),
        })
    }

    /// Subscribe to the states produced from now on.
    pub fn subscribe(&self) -> Subscription<Arc<CompositeState>> {
        self.broadcast.subscribe()
    }

    pub fn is_completed(&self) -> bool {
        self.broadcast.is_completed()
    }

    /// Stop producing and complete the stream. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.run.store(false, Ordering::SeqCst);

        if let Some(jh) = self.jh.take() {
            if jh.join().is_err() {
                error!("Information stream thread panicked");
            }
            info!("Information stream stopped");
        }

        self.broadcast.complete();
    }
}

impl Drop for InfoStream {
    fn drop(&mut self) {
        self.shutdown()
    }
}

impl Producer {
    fn run(mut self) {
        info!("Information stream started");

        while self.run.load(Ordering::SeqCst) {
            let sample = match self.source.recv_sample(self.sample_period) {
                Ok(Some(s)) => s,
                Ok(None) => continue,
                Err(e) => {
                    if self.run.load(Ordering::SeqCst) {
                        error!("Telemetry source failed: {}", e);
                        self.terminate(Termination::TransportError(e));
                    }
                    break;
                }
            };

            let state = match self.produce(sample) {
                Produced::State(s) => s,
                Produced::NoMap => continue,
                Produced::Failed => break,
            };

            if state.geo.is_none() {
                error!(
                    "Sensing lost at state {}, terminating the information stream",
                    state.seq
                );
                self.terminate(Termination::SensingLost);
                break;
            }

            trace!(
                "State {}: speed {:.2} km/h, geo {:?}",
                state.seq,
                state.vehicle.speed_kmh,
                state.geo
            );

            self.broadcast.publish(Arc::new(state));
        }

        debug!("Information stream producer exiting");
    }

    /// Build the state for this sample.
    fn produce(&mut self, sample: TelemetrySample) -> Produced {
        let pose = match self.fusion.fuse(&sample.gnss, &sample.imu, &sample.vehicle) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Could not fuse sample: {}", e);
                None
            }
        };

        let nav = self.nav.clone();
        let (geo, path_index, path_changed) = {
            let mut nav = match nav.lock() {
                Ok(n) => n,
                Err(_) => {
                    error!("Navigator lock poisoned");
                    self.terminate(Termination::SensingLost);
                    return Produced::Failed;
                }
            };

            // Nothing to navigate against until a map is set
            if !nav.has_map() {
                trace!("No map set, dropping sample");
                return Produced::NoMap;
            }

            let geo = pose.and_then(|p| nav.update(p.position_m, p.heading_rad));
            (geo, nav.current_path_index(), nav.take_path_changed())
        };

        let state = CompositeState {
            seq: self.seq,
            timestamp: sample.timestamp,
            is_active: self.is_active.load(Ordering::SeqCst),
            vehicle: sample.vehicle,
            gnss: sample.gnss,
            imu: sample.imu,
            pose,
            geo,
            path_index,
            path_changed,
        };
        self.seq += 1;

        Produced::State(state)
    }

    fn terminate(&mut self, cause: Termination) {
        if self.broadcast.complete() {
            if let Some(f) = self.on_terminate.take() {
                f(cause)
            }
        }
    }
}

impl From<Cancelled> for WaitError {
    fn from(_: Cancelled) -> Self {
        WaitError::Cancelled
    }
}
