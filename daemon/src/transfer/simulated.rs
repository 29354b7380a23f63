//! Simulated relay used when no host is configured

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{TransferError, TransferJob, Transport};

/// Pretends to upload after a fixed latency
#[derive(Debug, Clone)]
pub struct SimulatedRelay {
    latency: Duration,
    fail: bool,
}

impl SimulatedRelay {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail: false,
        }
    }

    /// A relay that fails every attempt, for exercising the retry path
    pub fn failing(latency: Duration) -> Self {
        Self {
            latency,
            fail: true,
        }
    }
}

#[async_trait]
impl Transport for SimulatedRelay {
    async fn transfer(&self, job: &TransferJob) -> Result<(), TransferError> {
        for path in [&job.audio_path, &job.color_path] {
            if tokio::fs::metadata(path).await.is_err() {
                return Err(TransferError::MissingArtifact(path.clone()));
            }
        }

        info!(id = job.id, latency_ms = self.latency.as_millis() as u64, "simulating upload");
        tokio::time::sleep(self.latency).await;

        if self.fail {
            Err(TransferError::Simulated)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_in(dir: &std::path::Path) -> TransferJob {
        TransferJob {
            id: 7,
            audio_path: dir.join("audio.wav"),
            color_path: dir.join("color.dat"),
        }
    }

    #[test]
    fn test_missing_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let result = tokio_test::block_on(SimulatedRelay::new(Duration::ZERO).transfer(&job));
        assert_eq!(result, Err(TransferError::MissingArtifact(job.audio_path)));
    }

    #[tokio::test]
    async fn test_success_and_forced_failure() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        std::fs::write(&job.audio_path, b"RIFF").unwrap();
        std::fs::write(&job.color_path, "1,2,3\n").unwrap();

        assert_eq!(SimulatedRelay::new(Duration::ZERO).transfer(&job).await, Ok(()));
        assert_eq!(
            SimulatedRelay::failing(Duration::ZERO).transfer(&job).await,
            Err(TransferError::Simulated)
        );
        // Retrying never consumes the artifacts
        assert!(job.audio_path.exists() && job.color_path.exists());
    }
}
