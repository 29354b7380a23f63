//! Per-tick sensor readings and edge detection
//!
//! Provides the raw readings sampled from the sensor board and the
//! snapshot the controller builds from them, which adds the previous
//! cap state for one-tick edge detection.

use serde::{Deserialize, Serialize};

/// Highest value the selector potentiometer reports (12-bit ADC)
pub const MAX_SELECTOR: u16 = 4095;

/// Selector values at or above this select the color sensor
pub const SELECTOR_MIDPOINT: u16 = 2048;

/// Which capture branch the selector currently points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    /// Microphone
    Audio,
    /// Color sensor
    Color,
}

impl SensorType {
    /// Map a selector reading onto a sensor type
    pub fn from_selector(value: u16) -> Self {
        if value < SELECTOR_MIDPOINT {
            SensorType::Audio
        } else {
            SensorType::Color
        }
    }
}

impl Default for SensorType {
    fn default() -> Self {
        Self::Audio
    }
}

impl std::fmt::Display for SensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorType::Audio => write!(f, "Audio"),
            SensorType::Color => write!(f, "Color"),
        }
    }
}

/// An RGB reading from the color sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl Default for Rgb {
    fn default() -> Self {
        Self::new(128, 64, 200)
    }
}

/// Formats as `r,g,b`, the layout used on disk and on the wire
impl std::fmt::Display for Rgb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.r, self.g, self.b)
    }
}

/// Raw readings of the physical inputs at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReadings {
    /// Cap is removed
    pub cap_open: bool,
    /// Bottle is tilted
    pub tilted: bool,
    /// Selector potentiometer, `0..=MAX_SELECTOR`
    pub selector: u16,
    /// Current color sensor reading
    pub color: Rgb,
}

/// A change of the cap switch between two consecutive ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapEdge {
    Opened,
    Closed,
}

/// Immutable view of one tick's readings plus the prior tick's cap state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSnapshot {
    readings: SensorReadings,
    previous_cap_open: bool,
}

impl SensorSnapshot {
    pub fn new(readings: SensorReadings, previous_cap_open: bool) -> Self {
        Self {
            readings,
            previous_cap_open,
        }
    }

    pub fn tilted(&self) -> bool {
        self.readings.tilted
    }

    pub fn selector(&self) -> u16 {
        self.readings.selector
    }

    pub fn color(&self) -> Rgb {
        self.readings.color
    }

    /// Cap was closed last tick and is open now
    pub fn cap_just_opened(&self) -> bool {
        !self.previous_cap_open && self.readings.cap_open
    }

    /// Cap was open last tick and is closed now
    pub fn cap_just_closed(&self) -> bool {
        self.previous_cap_open && !self.readings.cap_open
    }

    pub fn cap_edge(&self) -> Option<CapEdge> {
        if self.cap_just_opened() {
            Some(CapEdge::Opened)
        } else if self.cap_just_closed() {
            Some(CapEdge::Closed)
        } else {
            None
        }
    }

    /// Cap open while tilted
    pub fn is_pour_gesture(&self) -> bool {
        self.readings.cap_open && self.readings.tilted
    }

    pub fn selected_sensor(&self) -> SensorType {
        SensorType::from_selector(self.readings.selector)
    }
}
