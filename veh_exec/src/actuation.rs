//! # Actuation loop
//!
//! Sends the shared operation to the vehicle at a fixed rate from a background thread.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use util::cancel::CancelToken;

use crate::{operation::SharedOperation, transport::ActuationSink};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct ActuationLoop {
    sink: Arc<dyn ActuationSink>,
    operation: SharedOperation,
    stop: CancelToken,
    jh: Option<JoinHandle<()>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ActuationError {
    #[error("Could not spawn the actuation thread: {0}")]
    SpawnError(std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ActuationLoop {
    /// Start sending the operation every `period`.
    pub fn start(
        sink: Arc<dyn ActuationSink>,
        operation: SharedOperation,
        period: Duration,
    ) -> Result<Self, ActuationError> {
        let stop = CancelToken::new();

        let jh = {
            let sink = sink.clone();
            let operation = operation.clone();
            let stop = stop.clone();
            let period = period.max(Duration::from_millis(1));

            thread::Builder::new()
                .name("actuation".into())
                .spawn(move || {
                    info!("Actuation loop started");

                    loop {
                        if let Err(e) = sink.send_operation(&operation.snapshot()) {
                            warn!("Could not send operation: {}", e);
                        }

                        if stop.sleep(period).is_err() {
                            break;
                        }
                    }

                    info!("Actuation loop stopped");
                })
                .map_err(ActuationError::SpawnError)?
        };

        Ok(Self {
            sink,
            operation,
            stop,
            jh: Some(jh),
        })
    }

    /// Send the current operation immediately, outside the loop's schedule.
    pub fn flush(&self) {
        if let Err(e) = self.sink.send_operation(&self.operation.snapshot()) {
            warn!("Could not flush operation: {}", e);
        }
    }

    /// Ask the loop to stop without waiting for it.
    pub fn signal_stop(&self) {
        self.stop.cancel();
    }

    /// Stop the loop and wait for it. Safe to call more than once.
    pub fn stop(&mut self) {
        self.signal_stop();

        if let Some(jh) = self.jh.take() {
            if jh.join().is_err() {
                error!("Actuation thread panicked");
            }
            debug!("Actuation thread joined");
        }
    }
}

impl Drop for ActuationLoop {
    fn drop(&mut self) {
        self.stop()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::RecordingSink;

    #[test]
    fn test_actuation_loop() {
        let sink = Arc::new(RecordingSink::default());
        let op = SharedOperation::new();
        let mut act =
            ActuationLoop::start(sink.clone(), op.clone(), Duration::from_millis(5)).unwrap();

        op.drive_channel().set_foot_brake(2);
        act.flush();
        thread::sleep(Duration::from_millis(30));

        act.stop();
        act.stop();

        let ops = sink.operations();
        let n = ops.len();
        assert!(n >= 2);
        assert_eq!(ops[n - 1].foot_brake, 2);

        // Nothing is sent once stopped
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.operations().len(), n);
    }
}
