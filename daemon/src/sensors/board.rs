//! Simulated sensor board
//!
//! Stands in for the physical cap switch, tilt sensor, selector pot and
//! color sensor. Operator commands mutate the readings; the runtime samples
//! them once per tick.

use tracing::debug;

use super::snapshot::{Rgb, SensorReadings, MAX_SELECTOR};

/// Errors raised when a command would put the board out of range
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BoardError {
    #[error("selector value {0} out of range (0-{MAX_SELECTOR})")]
    SelectorOutOfRange(u16),
}

/// Current raw state of every simulated input
#[derive(Debug, Default)]
pub struct SensorBoard {
    readings: SensorReadings,
}

impl SensorBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample all inputs for the next tick
    pub fn sample(&self) -> SensorReadings {
        self.readings
    }

    pub fn open_cap(&mut self) {
        debug!("cap opened");
        self.readings.cap_open = true;
    }

    pub fn close_cap(&mut self) {
        debug!("cap closed");
        self.readings.cap_open = false;
    }

    pub fn set_tilt(&mut self, tilted: bool) {
        debug!(tilted, "tilt changed");
        self.readings.tilted = tilted;
    }

    pub fn set_selector(&mut self, value: u16) -> Result<(), BoardError> {
        if value > MAX_SELECTOR {
            return Err(BoardError::SelectorOutOfRange(value));
        }
        debug!(value, "selector moved");
        self.readings.selector = value;
        Ok(())
    }

    pub fn set_color(&mut self, color: Rgb) {
        debug!(%color, "color reading changed");
        self.readings.color = color;
    }

    /// Cap closed, upright, selector at zero. The color reading is kept.
    pub fn reset(&mut self) {
        let color = self.readings.color;
        self.readings = SensorReadings {
            color,
            ..SensorReadings::default()
        };
    }
}
