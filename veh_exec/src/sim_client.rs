//! # Simulation Client
//!
//! The SimClient connects the vehicle software to the simulator's vehicle interface. The simulator
//! is reached over a TCP socket carrying line-delimited JSON [`SimMessage`]s: telemetry flows from
//! the simulator and operations flow back to it.
//!
//! Optionally the simulator can be launched as a companion process before connecting, in which
//! case it is killed when the transport is released.
//!
//! The resulting [`Transport`] holds three resources, released in this order:
//!
//! - `connector` - the line stream halves, after which no more messages can be exchanged.
//! - `client` - the socket itself.
//! - `process` - the companion simulator process, if one was launched.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    io::ErrorKind,
    net::{Shutdown, TcpStream},
    process::{Child, Command},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use comms_if::{
    eqpt::vehicle::{Operation, SimMessage, TelemetrySample},
    net::{CompanionParams, LineReader, LineStream, LineStreamError, LineWriter, NetParams},
};
use log::{debug, info, warn};

use crate::transport::{ActuationSink, Resource, TelemetrySource, Transport, TransportError};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Builds a [`Transport`] connected to the simulator.
pub struct SimClient;

/// The message-level connection to the simulator.
pub struct SimConnector {
    reader: Mutex<Option<LineReader>>,
    writer: Mutex<Option<LineWriter>>,
}

/// The simulator socket.
pub struct SimSocket {
    socket: Mutex<Option<TcpStream>>,
}

/// A process launched alongside the vehicle software.
pub struct CompanionProcess {
    program: String,
    child: Mutex<Option<Child>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SimClientError {
    #[error("Could not launch the companion process {0}: {1}")]
    CompanionSpawnError(String, std::io::Error),

    #[error("Could not connect to the simulator: {0}")]
    ConnectError(LineStreamError),

    #[error("Could not set up the simulator stream: {0}")]
    StreamError(LineStreamError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SimClient {
    /// Launch the companion process (if any) and connect to the simulator.
    pub fn connect(params: &NetParams) -> Result<Transport, SimClientError> {
        let process = match params.companion {
            Some(ref c) => {
                let p = CompanionProcess::spawn(c)?;
                thread::sleep(Duration::from_millis(c.startup_delay_ms));
                Some(Arc::new(p))
            }
            None => None,
        };

        let stream = match connect_with_retry(params) {
            Ok(s) => s,
            Err(e) => {
                if let Some(p) = process {
                    p.release().ok();
                }
                return Err(e);
            }
        };

        let socket = stream.socket().map_err(SimClientError::StreamError)?;
        let (reader, writer) = stream.split().map_err(SimClientError::StreamError)?;

        let connector = Arc::new(SimConnector::new(reader, writer));

        let mut resources: Vec<Arc<dyn Resource>> = vec![
            connector.clone(),
            Arc::new(SimSocket {
                socket: Mutex::new(Some(socket)),
            }),
        ];
        if let Some(p) = process {
            resources.push(p);
        }

        info!("Connected to the simulator at {}", params.sim_endpoint);

        Ok(Transport {
            source: connector.clone(),
            sink: connector,
            resources,
        })
    }
}

impl SimConnector {
    pub fn new(reader: LineReader, writer: LineWriter) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }
}

impl TelemetrySource for SimConnector {
    fn recv_sample(&self, timeout: Duration) -> Result<Option<TelemetrySample>, TransportError> {
        let mut guard = self.reader.lock()?;
        let reader = guard.as_mut().ok_or(TransportError::Released)?;

        match reader.recv::<SimMessage>(timeout) {
            Ok(Some(SimMessage::Telemetry(s))) => Ok(Some(s)),
            Ok(Some(m)) => {
                warn!("Unexpected message from the simulator: {:?}", m);
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(LineStreamError::DeserializeError(e)) => {
                warn!("Malformed message from the simulator: {}", e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl ActuationSink for SimConnector {
    fn send_operation(&self, operation: &Operation) -> Result<(), TransportError> {
        let mut guard = self.writer.lock()?;
        let writer = guard.as_mut().ok_or(TransportError::Released)?;

        writer
            .send(&SimMessage::Operation(*operation))
            .map_err(TransportError::from)
    }
}

impl Resource for SimConnector {
    fn name(&self) -> &str {
        "connector"
    }

    fn release(&self) -> Result<(), TransportError> {
        if let Some(w) = self.writer.lock()?.take() {
            w.shutdown();
        }
        self.reader.lock()?.take();

        Ok(())
    }
}

impl Resource for SimSocket {
    fn name(&self) -> &str {
        "client"
    }

    fn release(&self) -> Result<(), TransportError> {
        if let Some(s) = self.socket.lock()?.take() {
            match s.shutdown(Shutdown::Both) {
                Ok(_) => (),
                // Already closed by the other end
                Err(e) if e.kind() == ErrorKind::NotConnected => (),
                Err(e) => return Err(TransportError::SocketError(e)),
            }
        }

        Ok(())
    }
}

impl CompanionProcess {
    pub fn spawn(params: &CompanionParams) -> Result<Self, SimClientError> {
        let child = Command::new(&params.program)
            .args(&params.args)
            .spawn()
            .map_err(|e| SimClientError::CompanionSpawnError(params.program.clone(), e))?;

        info!("Launched {} (pid {})", params.program, child.id());

        Ok(Self {
            program: params.program.clone(),
            child: Mutex::new(Some(child)),
        })
    }
}

impl Resource for CompanionProcess {
    fn name(&self) -> &str {
        "process"
    }

    fn release(&self) -> Result<(), TransportError> {
        let mut child = match self.child.lock()?.take() {
            Some(c) => c,
            None => return Ok(()),
        };

        match child.kill() {
            Ok(_) => (),
            // Already exited
            Err(e) if e.kind() == ErrorKind::InvalidInput => (),
            Err(e) => return Err(TransportError::ProcessError(e)),
        }

        let status = child.wait().map_err(TransportError::ProcessError)?;
        debug!("{} exited with {}", self.program, status);

        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn connect_with_retry(params: &NetParams) -> Result<LineStream, SimClientError> {
    let timeout = Duration::from_millis(params.connect_timeout_ms);
    let attempts = params.connect_attempts.max(1);

    let mut attempt = 1;
    loop {
        match LineStream::connect(&params.sim_endpoint, timeout) {
            Ok(s) => return Ok(s),
            Err(e) if attempt < attempts => {
                warn!(
                    "Connection attempt {}/{} failed: {}, retrying",
                    attempt, attempts, e
                );
                thread::sleep(timeout);
                attempt += 1;
            }
            Err(e) => return Err(SimClientError::ConnectError(e)),
        }
    }
}
