pub mod capture;
pub mod playback;

use thiserror::Error;

pub use capture::{AudioCapture, AudioCaptureConfig};
pub use playback::{AudioPlayback, AudioPlaybackConfig, Cue};

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Playback buffer full")]
    BufferFull,

    #[error("Cue file error: {0}")]
    Cue(String),

    #[error("Audio capture not running")]
    NotRunning,
}

/// One fixed-size chunk of mono 16-bit PCM in capture order.
///
/// Sequence numbers increase monotonically per capture stream; consumers use
/// them to detect dropped frames.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub seq: u64,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Samples as little-endian PCM bytes, the on-wire format for the
    /// conversation session.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        pcm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_pcm_bytes_little_endian() {
        let frame = AudioFrame {
            seq: 0,
            samples: vec![0, 1, -1, i16::MAX],
        };
        let pcm = frame.to_pcm_bytes();
        assert_eq!(pcm.len(), 8);
        assert_eq!(&pcm[0..2], &[0x00, 0x00]);
        assert_eq!(&pcm[2..4], &[0x01, 0x00]);
        assert_eq!(&pcm[4..6], &[0xFF, 0xFF]);
    }
}
