pub mod engine;

use std::time::{Duration, Instant};
use thiserror::Error;

pub use engine::RustpotterEngine;

#[derive(Error, Debug)]
pub enum WakewordError {
    #[error("Wakeword engine initialization failed: {0}")]
    Init(String),

    #[error("Wakeword model error: {0}")]
    Model(String),

    #[error("Wakeword processing failed: {0}")]
    Processing(String),
}

/// Emitted when the trigger phrase is recognized. Consumed once by the
/// orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct WakewordEvent {
    pub timestamp: Instant,
    pub confidence: f32,
}

/// A keyword hit reported by the engine: which keyword, and how sure.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub keyword_index: usize,
    pub confidence: f32,
}

/// Boundary to the third-party wakeword engine: PCM frames in, an optional
/// keyword detection out. Engines buffer internally when their native frame
/// size differs from the capture chunk size.
pub trait WakewordEngine: Send {
    fn process(&mut self, frame: &[i16]) -> Result<Option<Detection>, WakewordError>;
}

/// Wraps an engine with the retrigger policy: after each emitted event the
/// detector stays silent for the refractory period, so one spoken instance of
/// the phrase produces exactly one event.
pub struct WakewordDetector {
    engine: Box<dyn WakewordEngine>,
    refractory: Duration,
    last_event: Option<Instant>,
}

impl WakewordDetector {
    pub fn new(engine: Box<dyn WakewordEngine>, refractory: Duration) -> Self {
        Self {
            engine,
            refractory,
            last_event: None,
        }
    }

    /// Feed one capture frame. Engine failures are fatal to the listening
    /// pipeline and propagate to the caller.
    pub fn process_frame(&mut self, frame: &[i16]) -> Result<Option<WakewordEvent>, WakewordError> {
        let detection = match self.engine.process(frame)? {
            Some(detection) => detection,
            None => return Ok(None),
        };

        let now = Instant::now();
        if let Some(last) = self.last_event {
            if now.duration_since(last) < self.refractory {
                log::debug!(
                    "Wakeword re-detection within refractory period suppressed (confidence: {:.2})",
                    detection.confidence
                );
                return Ok(None);
            }
        }

        self.last_event = Some(now);
        log::info!(
            "🎤 Wakeword detected (keyword {}, confidence: {:.2})",
            detection.keyword_index,
            detection.confidence
        );
        Ok(Some(WakewordEvent {
            timestamp: now,
            confidence: detection.confidence,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted engine: yields the queued detections in order.
    struct ScriptedEngine {
        detections: Vec<Option<Detection>>,
        fail: bool,
    }

    impl WakewordEngine for ScriptedEngine {
        fn process(&mut self, _frame: &[i16]) -> Result<Option<Detection>, WakewordError> {
            if self.fail {
                return Err(WakewordError::Processing("engine died".to_string()));
            }
            if self.detections.is_empty() {
                Ok(None)
            } else {
                Ok(self.detections.remove(0))
            }
        }
    }

    fn hit(confidence: f32) -> Option<Detection> {
        Some(Detection {
            keyword_index: 0,
            confidence,
        })
    }

    #[test]
    fn test_detection_emits_event_with_confidence() {
        let engine = ScriptedEngine {
            detections: vec![hit(0.9)],
            fail: false,
        };
        let mut detector = WakewordDetector::new(Box::new(engine), Duration::from_millis(500));

        let event = detector.process_frame(&[0; 512]).unwrap().unwrap();
        assert!((event.confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_refractory_suppresses_back_to_back_detections() {
        let engine = ScriptedEngine {
            detections: vec![hit(0.9), hit(0.8), hit(0.7)],
            fail: false,
        };
        let mut detector = WakewordDetector::new(Box::new(engine), Duration::from_secs(60));

        assert!(detector.process_frame(&[0; 512]).unwrap().is_some());
        assert!(detector.process_frame(&[0; 512]).unwrap().is_none());
        assert!(detector.process_frame(&[0; 512]).unwrap().is_none());
    }

    #[test]
    fn test_zero_refractory_allows_repeat_detections() {
        let engine = ScriptedEngine {
            detections: vec![hit(0.9), hit(0.8)],
            fail: false,
        };
        let mut detector = WakewordDetector::new(Box::new(engine), Duration::ZERO);

        assert!(detector.process_frame(&[0; 512]).unwrap().is_some());
        assert!(detector.process_frame(&[0; 512]).unwrap().is_some());
    }

    #[test]
    fn test_engine_failure_propagates() {
        let engine = ScriptedEngine {
            detections: vec![],
            fail: true,
        };
        let mut detector = WakewordDetector::new(Box::new(engine), Duration::ZERO);

        assert!(detector.process_frame(&[0; 512]).is_err());
    }

    #[test]
    fn test_silence_produces_no_event() {
        let engine = ScriptedEngine {
            detections: vec![None, None],
            fail: false,
        };
        let mut detector = WakewordDetector::new(Box::new(engine), Duration::ZERO);

        assert!(detector.process_frame(&[0; 512]).unwrap().is_none());
        assert!(detector.process_frame(&[0; 512]).unwrap().is_none());
    }
}
