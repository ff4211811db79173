//! # Equipment Interface
//!
//! This module defines the interface structures which are exchanged with the vehicle (or the
//! simulator standing in for it).

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod vehicle;
