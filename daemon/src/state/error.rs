//! Error taxonomy of the device

use crate::capture::CaptureError;
use crate::memory::StoreError;
use crate::transfer::TransferError;

use super::machine::State;

/// Errors reported by the controller
///
/// Only [`DeviceError::is_fatal`] errors move the controller into
/// [`State::Error`]; the rest are reported and leave the state unchanged.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// An artifact or the presence record could not be written
    #[error("capture failed: {0}")]
    CaptureIo(#[from] CaptureError),

    /// The storage layer failed outside of a capture (clearing)
    ///
    /// Fatal: the presence record may no longer match the artifacts, so
    /// the controller waits in Error for a reset to clear again.
    #[error("storage failed: {0}")]
    Storage(#[from] StoreError),

    /// A transfer attempt failed; fatal once the retry budget is spent
    #[error("transfer failed ({attempts}/{max} attempts): {source}")]
    TransferFailure {
        attempts: u8,
        max: u8,
        #[source]
        source: TransferError,
    },

    /// Command not allowed in the current state or malformed
    #[error("invalid command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    /// Cap opened while tilted with fewer than two items
    #[error("incomplete pour attempt: {items}/2 items captured")]
    IncompletePourAttempt { items: u8 },

    /// The device loop is no longer accepting commands
    #[error("device runtime is not running")]
    Unavailable,
}

impl DeviceError {
    pub fn invalid_command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn not_in_state(command: impl Into<String>, state: State) -> Self {
        Self::invalid_command(command, format!("not allowed in {} state", state))
    }

    /// Whether this error leaves the controller in the Error state
    pub fn is_fatal(&self) -> bool {
        match self {
            DeviceError::CaptureIo(_) | DeviceError::Storage(_) => true,
            DeviceError::TransferFailure { attempts, max, .. } => attempts >= max,
            DeviceError::InvalidCommand { .. }
            | DeviceError::IncompletePourAttempt { .. }
            | DeviceError::Unavailable => false,
        }
    }

    /// Stable machine-readable code used on the IPC surface
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::CaptureIo(_) => "capture_io_error",
            DeviceError::Storage(_) => "storage_error",
            DeviceError::TransferFailure { .. } => "transfer_failure",
            DeviceError::InvalidCommand { .. } => "invalid_command",
            DeviceError::IncompletePourAttempt { .. } => "incomplete_pour_attempt",
            DeviceError::Unavailable => "unavailable",
        }
    }
}
