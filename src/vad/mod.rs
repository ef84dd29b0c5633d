//! Voice activity detection on fixed-size mono frames.
//!
//! The capture stage only needs a yes/no per frame; segmentation into
//! utterances lives in [`crate::pipeline::capture`].

use tracing::info;

use crate::config::VadConfig;
use crate::error::{AssistantError, Result};

/// Classifies one mono int16 frame as speech or not.
pub trait VoiceActivityDetector: Send {
    /// Whether `frame` contains speech.
    fn is_speech(&mut self, frame: &[i16]) -> bool;

    /// Short backend name for logs.
    fn name(&self) -> &str;
}

/// RMS energy threshold detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    /// Create a detector that fires when frame RMS exceeds `threshold`
    /// (int16 units).
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn is_speech(&mut self, frame: &[i16]) -> bool {
        compute_rms_energy(frame) > self.threshold
    }

    fn name(&self) -> &str {
        "energy"
    }
}

/// Compute RMS energy of int16 samples.
pub fn compute_rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Build the configured detector.
///
/// # Errors
///
/// Returns an error for an unknown backend or a non-positive threshold.
pub fn create_vad(config: &VadConfig) -> Result<Box<dyn VoiceActivityDetector>> {
    match config.backend.as_str() {
        "energy" => {
            if !(config.energy_threshold.is_finite() && config.energy_threshold > 0.0) {
                return Err(AssistantError::Vad(format!(
                    "energy threshold must be positive, got {}",
                    config.energy_threshold
                )));
            }
            info!(threshold = config.energy_threshold, "energy VAD initialised");
            Ok(Box::new(EnergyVad::new(config.energy_threshold)))
        }
        other => Err(AssistantError::Vad(format!("unknown VAD backend: {other}"))),
    }
}
