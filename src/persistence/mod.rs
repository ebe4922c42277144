//! # Persistence Module
//!
//! ## Why This Module Exists
//! The device has to come back from a power cut with the light at the level it was
//! last told to use. This module owns the single durable value that makes that
//! possible.
//!
//! ## Error Handling Strategy
//! Storage is never allowed to take the device down. If the medium cannot be
//! prepared at startup the store reports it once and turns into a no-op; the
//! device keeps working purely in memory. Individual write failures on an
//! available medium are logged and otherwise ignored.
//!
//! ## Layout
//! One file holding the ASCII decimal level followed by a newline. Writes go to a
//! sibling temporary file that is renamed over the old one, so a crash mid-write
//! leaves either the old or the new value on disk.

pub mod setpoint_store;

pub use setpoint_store::SetpointStore;
