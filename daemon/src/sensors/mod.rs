//! Sensor module for the bottle's physical inputs
//!
//! The board holds the simulated raw readings; the snapshot adds
//! edge detection on top of one tick's sample.

mod board;
mod snapshot;

pub use board::SensorBoard;
pub use snapshot::{CapEdge, Rgb, SensorReadings, SensorSnapshot, SensorType, MAX_SELECTOR};
