//! Transfer pipeline
//!
//! Moves a completed memory to the host. Transports only read the
//! artifacts, so a failed attempt can be retried with the same job without
//! touching the memory store.

mod http;
mod simulated;

use std::path::PathBuf;

use async_trait::async_trait;

pub use http::HttpRelay;
pub use simulated::SimulatedRelay;

/// One dispatched transfer of the current memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    /// Identifies the attempt so late completions can be told apart
    pub id: u64,
    pub audio_path: PathBuf,
    pub color_path: PathBuf,
}

/// Why a transfer attempt failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("host rejected transfer with status {status}")]
    Rejected { status: u16 },

    #[error("artifact missing: {0:?}")]
    MissingArtifact(PathBuf),

    #[error("memory incomplete, nothing to transfer")]
    Incomplete,

    #[error("simulated transfer failure")]
    Simulated,
}

/// Moves both artifacts of a memory to the host
#[async_trait]
pub trait Transport: Send + Sync {
    async fn transfer(&self, job: &TransferJob) -> Result<(), TransferError>;
}
