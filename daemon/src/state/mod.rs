//! State machine module for the capture/transfer lifecycle
//!
//! Provides the controller that turns per-tick sensor samples into the
//! seven-state lifecycle:
//! - Idle: waiting for a gesture
//! - Selecting: selector being turned
//! - Recording: cap open, capture in progress
//! - Incomplete: one of the two items captured
//! - Ready: both items captured, waiting for the pour gesture
//! - Transferring: memory on its way to the host
//! - Error: fatal failure, waits for a reset

mod error;
mod machine;

pub use error::DeviceError;
pub use machine::{Controller, DeviceStatus, State};
