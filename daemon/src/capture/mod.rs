//! Capture pipeline
//!
//! Produces the audio or color artifact for the selected sensor and hands
//! it to the memory store, which marks the item present. Persisting the
//! flags is left to the controller.

mod wav;

use std::time::Duration;

use tracing::info;

use crate::memory::{MemoryStore, StoreError};
use crate::sensors::Rgb;

pub use wav::encode_pcm16_mono;

/// Microphone sample rate
pub const SAMPLE_RATE: u32 = 16_000;

/// Errors that end a capture attempt
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to store captured artifact")]
    Io(#[from] StoreError),

    #[error("microphone failed: {0}")]
    Microphone(String),
}

/// Produces artifacts into the memory store
pub trait Capture {
    /// Store `color` as the color item
    fn capture_color(&mut self, color: Rgb, store: &mut MemoryStore) -> Result<(), CaptureError>;

    /// Record exactly `duration` of audio and store it as the audio item
    fn capture_audio(
        &mut self,
        duration: Duration,
        store: &mut MemoryStore,
    ) -> Result<(), CaptureError>;
}

/// Capture backed by the simulated microphone, which only hears silence
#[derive(Debug, Clone)]
pub struct SimulatedCapture {
    sample_rate: u32,
}

impl SimulatedCapture {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl Default for SimulatedCapture {
    fn default() -> Self {
        Self::new(SAMPLE_RATE)
    }
}

impl Capture for SimulatedCapture {
    fn capture_color(&mut self, color: Rgb, store: &mut MemoryStore) -> Result<(), CaptureError> {
        store.put_color(color)?;
        info!(%color, "color captured");
        Ok(())
    }

    fn capture_audio(
        &mut self,
        duration: Duration,
        store: &mut MemoryStore,
    ) -> Result<(), CaptureError> {
        let sample_count = (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as usize;
        let samples = vec![0i16; sample_count];
        let wav = encode_pcm16_mono(&samples, self.sample_rate);

        store.put_audio(&wav)?;
        info!(
            samples = sample_count,
            bytes = wav.len(),
            "audio captured"
        );
        Ok(())
    }
}
