//! # Network Module
//!
//! This module provides the line-delimited JSON stream used to talk to the simulator. Every
//! message is serialised as a single line of JSON terminated by `\n`.
//!
//! A connected [`LineStream`] can be split into a [`LineReader`] and a [`LineWriter`] so that
//! receiving and sending happen from different threads without sharing a lock.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    io::{self, BufRead, BufReader, ErrorKind, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Network parameters, loaded from `net.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetParams {
    /// Endpoint of the simulator, for example `"127.0.0.1:3000"`.
    pub sim_endpoint: String,

    /// Time allowed for the TCP connection to be established.
    pub connect_timeout_ms: u64,

    /// Number of connection attempts made before giving up. Useful when the simulator is launched
    /// as a companion process and takes a while to start listening.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Optional simulator process to launch before connecting.
    #[serde(default)]
    pub companion: Option<CompanionParams>,
}

/// Description of a process to be spawned alongside the vehicle software.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionParams {
    /// Program to execute
    pub program: String,

    /// Arguments to pass to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Time to wait after spawning before the first connection attempt
    #[serde(default)]
    pub startup_delay_ms: u64,
}

/// A connected, line-delimited JSON stream.
pub struct LineStream {
    stream: TcpStream,
}

/// The receiving half of a [`LineStream`].
pub struct LineReader {
    reader: BufReader<TcpStream>,

    /// Bytes of a partially received line, kept between timed out reads.
    pending: Vec<u8>,
}

/// The sending half of a [`LineStream`].
pub struct LineWriter {
    stream: TcpStream,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum LineStreamError {
    #[error("Could not resolve the endpoint {0}")]
    InvalidEndpoint(String),

    #[error("Could not connect to {0}: {1}")]
    CouldNotConnect(String, io::Error),

    #[error("Could not configure the socket: {0}")]
    SocketOptionError(io::Error),

    #[error("The remote end closed the stream")]
    Closed,

    #[error("Could not recieve a message: {0}")]
    RecvError(io::Error),

    #[error("Could not send a message: {0}")]
    SendError(io::Error),

    #[error("Could not serialize the message: {0}")]
    SerializationError(serde_json::Error),

    #[error("Could not deserialize the message: {0}")]
    DeserializeError(serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl LineStream {
    /// Connect to the given endpoint.
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<Self, LineStreamError> {
        let addr = endpoint
            .to_socket_addrs()
            .map_err(|_| LineStreamError::InvalidEndpoint(endpoint.into()))?
            .next()
            .ok_or_else(|| LineStreamError::InvalidEndpoint(endpoint.into()))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| LineStreamError::CouldNotConnect(endpoint.into(), e))?;

        debug!("Connected to {}", addr);

        Self::from_stream(stream)
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self, LineStreamError> {
        stream
            .set_nodelay(true)
            .map_err(LineStreamError::SocketOptionError)?;

        Ok(Self { stream })
    }

    /// Get another handle to the underlying socket, for example to shut it down independently of
    /// the reading and writing halves.
    pub fn socket(&self) -> Result<TcpStream, LineStreamError> {
        self.stream
            .try_clone()
            .map_err(LineStreamError::SocketOptionError)
    }

    /// Split the stream into independent reading and writing halves.
    pub fn split(self) -> Result<(LineReader, LineWriter), LineStreamError> {
        let write_stream = self
            .stream
            .try_clone()
            .map_err(LineStreamError::SocketOptionError)?;

        Ok((
            LineReader {
                reader: BufReader::new(self.stream),
                pending: Vec::new(),
            },
            LineWriter {
                stream: write_stream,
            },
        ))
    }
}

impl LineReader {
    /// Receive the next message.
    ///
    /// Returns `Ok(None)` if no complete line arrived within `timeout`. Partial lines are kept
    /// and completed by later calls.
    pub fn recv<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<T>, LineStreamError> {
        // A zero timeout would make the socket blocking
        let timeout = timeout.max(Duration::from_millis(1));
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(LineStreamError::SocketOptionError)?;

        loop {
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => return Err(LineStreamError::Closed),
                Ok(_) => {
                    if self.pending.last() != Some(&b'\n') {
                        // EOF part way through a line
                        return Err(LineStreamError::Closed);
                    }

                    let line = std::mem::take(&mut self.pending);

                    // Skip keep-alive blank lines
                    if line.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    return serde_json::from_slice(&line)
                        .map(Some)
                        .map_err(LineStreamError::DeserializeError);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(LineStreamError::RecvError(e)),
            }
        }
    }

    /// Shut down the underlying socket, unblocking any pending reads.
    pub fn shutdown(&self) {
        if let Err(e) = self.reader.get_ref().shutdown(Shutdown::Both) {
            debug!("Error shutting down stream: {}", e);
        }
    }
}

impl LineWriter {
    /// Send a message as a single line.
    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), LineStreamError> {
        let mut line = serde_json::to_vec(msg).map_err(LineStreamError::SerializationError)?;
        line.push(b'\n');

        self.stream
            .write_all(&line)
            .and_then(|_| self.stream.flush())
            .map_err(LineStreamError::SendError)
    }

    /// Shut down the sending direction of the socket.
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            debug!("Error shutting down stream: {}", e);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn default_connect_attempts() -> u32 {
    1
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{net::TcpListener, thread};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Msg {
        n: u32,
    }

    #[test]
    fn test_line_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();

            // A message split over two writes, then a blank line and a second message
            sock.write_all(b"{\"n\":").unwrap();
            sock.flush().unwrap();
            thread::sleep(Duration::from_millis(50));
            sock.write_all(b"1}\n\n{\"n\":2}\n").unwrap();

            // Echo back what the client sends
            let mut reader = BufReader::new(sock.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            line
        });

        let stream = LineStream::connect(&endpoint, Duration::from_secs(1)).unwrap();
        let (mut reader, mut writer) = stream.split().unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            if let Some(m) = reader.recv::<Msg>(Duration::from_millis(10)).unwrap() {
                received.push(m);
            }
        }
        assert_eq!(received, vec![Msg { n: 1 }, Msg { n: 2 }]);

        writer.send(&Msg { n: 3 }).unwrap();
        assert_eq!(server.join().unwrap(), "{\"n\":3}\n");

        // Server dropped its socket
        loop {
            match reader.recv::<Msg>(Duration::from_millis(10)) {
                Ok(None) => continue,
                Err(LineStreamError::Closed) => break,
                r => panic!("Unexpected result {:?}", r.map(|_| ())),
            }
        }
    }
}
