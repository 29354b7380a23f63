//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::device::Command;
use crate::events::DeviceEvent;
use crate::memory::StoredFile;
use crate::sensors::Rgb;
use crate::state::{DeviceError, DeviceStatus};

/// Requests from an operator or test harness to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request current daemon status
    GetStatus,

    /// Subscribe to device event notifications
    Subscribe,

    OpenCap,
    CloseCap,
    SetTilt { tilted: bool },
    SetSelector { value: u16 },
    SetColor { r: u8, g: u8, b: u8 },

    /// Start a transfer without the pour gesture (Ready only)
    ForceTransfer,

    /// Clear memory and return to Idle
    Reset,

    /// List files in storage
    ListFiles,
}

impl Request {
    /// The device command behind this request, if it is one
    pub fn to_command(&self) -> Option<Command> {
        let command = match *self {
            Request::Ping | Request::Subscribe => return None,
            Request::GetStatus => Command::GetStatus,
            Request::OpenCap => Command::OpenCap,
            Request::CloseCap => Command::CloseCap,
            Request::SetTilt { tilted } => Command::SetTilt(tilted),
            Request::SetSelector { value } => Command::SetSelector(value),
            Request::SetColor { r, g, b } => Command::SetColor(Rgb::new(r, g, b)),
            Request::ForceTransfer => Command::ForceTransfer,
            Request::Reset => Command::Reset,
            Request::ListFiles => Command::ListFiles,
        };
        Some(command)
    }
}

/// Responses from daemon to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Files in storage
    Files { files: Vec<StoredFile> },

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

impl From<&DeviceError> for Response {
    fn from(err: &DeviceError) -> Self {
        Response::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Push notification from daemon to subscribed clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A device event occurred
    Event { event: DeviceEvent },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Uptime in seconds
    pub uptime_secs: u64,

    pub device: DeviceStatus,
}

impl DaemonStatus {
    pub fn new(device: DeviceStatus, uptime_secs: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs,
            device,
        }
    }
}
