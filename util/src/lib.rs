//! Utility library for the vehicle control software
//!
//! Provides the ambient pieces shared by every executable in the workspace: logging, parameter
//! loading, the session (log file and archive directories), csv archiving, cooperative
//! cancellation and a handful of maths helpers.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod archive;
pub mod cancel;
pub mod host;
pub mod logger;
pub mod maths;
pub mod params;
pub mod session;
pub mod time;
