//! Events module for controller transitions
//!
//! Structured events emitted by the controller as the bottle moves through
//! its capture and transfer lifecycle. Subscribed IPC clients receive them
//! as push notifications.

use serde::{Deserialize, Serialize};

use crate::sensors::{Rgb, SensorType};
use crate::state::State;

/// Events emitted by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// The controller changed state
    StateChanged {
        from: State,
        to: State,
        /// Milliseconds spent in `from`
        duration_ms: u64,
    },

    /// Cap opened and a recording began
    RecordingStarted { sensor: SensorType },

    /// Recording ended by cap close or timeout
    RecordingStopped {
        sensor: SensorType,
        /// Items present after the recording (0-2)
        items: u8,
    },

    /// Color artifact written
    ColorCaptured { color: Rgb },

    /// Audio artifact written
    AudioCaptured,

    /// Cap opened while tilted without a complete memory
    IncompletePourAttempt { items: u8 },

    /// A transfer was handed to the transport
    TransferDispatched { id: u64 },

    /// The host accepted the memory
    TransferSucceeded { id: u64 },

    /// A transfer attempt failed
    TransferFailed {
        id: u64,
        /// Consecutive failures so far
        attempt: u8,
        reason: String,
    },

    /// Capture or transfer failure that requires a reset
    Fault { reason: String },

    /// Operator reset
    Reset,
}

impl std::fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEvent::StateChanged { from, to, .. } => write!(f, "STATE {} -> {}", from, to),
            DeviceEvent::RecordingStarted { sensor } => write!(f, "RECORDING_STARTED ({})", sensor),
            DeviceEvent::RecordingStopped { sensor, items } => {
                write!(f, "RECORDING_STOPPED ({}, {}/2 items)", sensor, items)
            }
            DeviceEvent::ColorCaptured { color } => write!(f, "COLOR_CAPTURED ({})", color),
            DeviceEvent::AudioCaptured => write!(f, "AUDIO_CAPTURED"),
            DeviceEvent::IncompletePourAttempt { items } => {
                write!(f, "INCOMPLETE_POUR_ATTEMPT ({}/2 items)", items)
            }
            DeviceEvent::TransferDispatched { id } => write!(f, "TRANSFER_DISPATCHED #{}", id),
            DeviceEvent::TransferSucceeded { id } => write!(f, "TRANSFER_SUCCEEDED #{}", id),
            DeviceEvent::TransferFailed { id, attempt, reason } => {
                write!(f, "TRANSFER_FAILED #{} (attempt {}: {})", id, attempt, reason)
            }
            DeviceEvent::Fault { reason } => write!(f, "FAULT ({})", reason),
            DeviceEvent::Reset => write!(f, "RESET"),
        }
    }
}
