use thiserror::Error;
use voice_activity_detector::VoiceActivityDetector;

#[derive(Error, Debug)]
pub enum VadError {
    #[error("VAD initialization failed: {0}")]
    Init(String),
}

/// Per-frame speech gate over the Silero VAD.
///
/// Drives barge-in (speech while the assistant is talking) and follow-up
/// reactivation. The probability threshold is configuration, not policy.
pub struct SpeechGate {
    vad: VoiceActivityDetector,
    threshold: f32,
}

impl SpeechGate {
    pub fn new(sample_rate: u32, chunk_size: usize, threshold: f32) -> Result<Self, VadError> {
        let vad = VoiceActivityDetector::builder()
            .sample_rate(sample_rate as i64)
            .chunk_size(chunk_size)
            .build()
            .map_err(|e| VadError::Init(e.to_string()))?;

        log::debug!("Speech gate initialized (threshold: {threshold:.2})");
        Ok(Self { vad, threshold })
    }

    /// True when the frame carries speech at or above the configured
    /// probability threshold.
    pub fn is_speech(&mut self, frame: &[i16]) -> bool {
        let probability = self.vad.predict(frame.iter().copied());
        probability >= self.threshold
    }
}
