//! # Transport
//!
//! Capability traits implemented by anything able to connect the control core to a vehicle. A
//! [`Transport`] bundles the telemetry source, the actuation sink, and the resources which must be
//! released (in order) when the vehicle software shuts down.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{sync::Arc, time::Duration};

use comms_if::{
    eqpt::vehicle::{Operation, TelemetrySample},
    net::LineStreamError,
};
use log::{info, warn};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A source of telemetry samples.
pub trait TelemetrySource: Send + Sync {
    /// Wait up to `timeout` for the next sample.
    ///
    /// Returns `Ok(None)` if no sample arrived in time. Errors are unrecoverable.
    fn recv_sample(&self, timeout: Duration) -> Result<Option<TelemetrySample>, TransportError>;
}

/// A sink accepting actuation demands.
pub trait ActuationSink: Send + Sync {
    fn send_operation(&self, operation: &Operation) -> Result<(), TransportError>;
}

/// Something which must be released on shutdown.
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;

    fn release(&self) -> Result<(), TransportError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A connection to a vehicle.
#[derive(Clone)]
pub struct Transport {
    pub source: Arc<dyn TelemetrySource>,
    pub sink: Arc<dyn ActuationSink>,

    /// Resources in the order they must be released.
    pub resources: Vec<Arc<dyn Resource>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("The transport has been released")]
    Released,

    #[error("The vehicle closed the connection")]
    Closed,

    #[error("Stream error: {0}")]
    StreamError(LineStreamError),

    #[error("Could not shut down the socket: {0}")]
    SocketError(std::io::Error),

    #[error("Could not stop the companion process: {0}")]
    ProcessError(std::io::Error),

    #[error("Sync primitive is poisoned")]
    PoisonError,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Transport {
    /// Release every resource in order. Failures are logged and do not stop later releases.
    pub fn release_all(&self) {
        for r in self.resources.iter() {
            match r.release() {
                Ok(_) => info!("Released {}", r.name()),
                Err(e) => warn!("Could not release {}: {}", r.name(), e),
            }
        }
    }
}

impl From<LineStreamError> for TransportError {
    fn from(e: LineStreamError) -> Self {
        match e {
            LineStreamError::Closed => TransportError::Closed,
            e => TransportError::StreamError(e),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TransportError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        TransportError::PoisonError
    }
}
