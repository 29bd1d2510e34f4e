use super::{Detection, WakewordEngine, WakewordError};
use crate::config::WakewordConfig;
use rustpotter::{Rustpotter, RustpotterConfig, SampleFormat};

/// Wakeword engine backed by rustpotter. Loads a trained model file and runs
/// fully offline; a missing or corrupt model is a fatal startup error.
pub struct RustpotterEngine {
    detector: Rustpotter,
    frame_size: usize,
    buffer: Vec<f32>,
}

impl RustpotterEngine {
    pub fn new(config: &WakewordConfig, sample_rate: u32) -> Result<Self, WakewordError> {
        let mut rp_config = RustpotterConfig::default();
        rp_config.fmt.sample_rate = sample_rate as usize;
        rp_config.fmt.channels = 1;
        rp_config.fmt.sample_format = SampleFormat::F32;
        rp_config.detector.threshold = config.sensitivity;

        let mut detector = Rustpotter::new(&rp_config)
            .map_err(|e| WakewordError::Init(format!("failed to create detector: {e}")))?;

        let model_path = config.model_path.to_string_lossy();
        detector
            .add_wakeword_from_file("wakeword", &model_path)
            .map_err(|e| WakewordError::Model(format!("{model_path}: {e}")))?;

        let frame_size = detector.get_samples_per_frame();
        log::info!(
            "Wakeword engine initialized (model: {}, threshold: {:.2}, frame: {} samples)",
            model_path,
            config.sensitivity,
            frame_size
        );

        Ok(Self {
            detector,
            frame_size,
            buffer: Vec::with_capacity(frame_size * 2),
        })
    }
}

impl WakewordEngine for RustpotterEngine {
    /// Capture chunks rarely match the engine's native frame size, so input
    /// is buffered and drained in engine-sized windows.
    fn process(&mut self, frame: &[i16]) -> Result<Option<Detection>, WakewordError> {
        self.buffer
            .extend(frame.iter().map(|&s| s as f32 / i16::MAX as f32));

        let mut detection = None;
        while self.buffer.len() >= self.frame_size {
            let window: Vec<f32> = self.buffer.drain(..self.frame_size).collect();
            if let Some(hit) = self.detector.process_samples(window) {
                detection = Some(Detection {
                    keyword_index: 0,
                    confidence: hit.score,
                });
            }
        }
        Ok(detection)
    }
}
