use super::AudioError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Device;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AudioPlaybackConfig {
    pub device_name: Option<String>,
    /// Rate of the PCM the model produces (24 kHz).
    pub sample_rate: u32,
    /// Maximum buffered audio in milliseconds.
    pub buffer_ms: u32,
    pub low_watermark: u8,
    pub high_watermark: u8,
}

impl Default for AudioPlaybackConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 24_000,
            buffer_ms: 45_000,
            low_watermark: 20,
            high_watermark: 80,
        }
    }
}

/// Speaker output fed from a bounded sample queue.
///
/// Model audio arrives in bursts well ahead of real time, so the queue holds
/// whole utterances; `interrupt()` flushes it for barge-in. The cpal stream
/// runs on its own thread and converts to the device rate with linear
/// interpolation.
pub struct AudioPlayback {
    queue: Arc<Mutex<VecDeque<f32>>>,
    rendering: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    capacity: usize,
    config: AudioPlaybackConfig,
    thread: Option<thread::JoinHandle<()>>,
}

impl AudioPlayback {
    pub fn start(config: AudioPlaybackConfig) -> Result<Self, AudioError> {
        let queue: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
        let rendering = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let capacity = (config.buffer_ms as usize * config.sample_rate as usize) / 1000;

        let device = Self::output_device(config.device_name.as_deref())?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::Device(format!("failed to get output config: {e}")))?;
        let device_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        log::info!(
            "🔊 Audio playback: device '{}', {} Hz ({} Hz source), {} channels",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            device_rate,
            config.sample_rate,
            channels
        );

        let queue_clone = Arc::clone(&queue);
        let rendering_clone = Arc::clone(&rendering);
        let stop_clone = Arc::clone(&stop);
        let step = config.sample_rate as f32 / device_rate as f32;

        let thread = thread::spawn(move || {
            let stream = match device.build_output_stream(
                &supported.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    let needed = (frames as f32 * step).ceil() as usize;

                    let chunk: Vec<f32> = {
                        let mut queue = queue_clone.lock().unwrap();
                        let take = needed.min(queue.len());
                        queue.drain(..take).collect()
                    };
                    rendering_clone.store(!chunk.is_empty(), Ordering::Release);

                    render_interpolated(&chunk, data, channels, step);
                },
                |err| log::error!("Playback stream error: {err}"),
                None,
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Failed to build playback stream: {e}");
                    return;
                }
            };

            if let Err(e) = stream.play() {
                log::error!("Failed to start playback stream: {e}");
                return;
            }

            while !stop_clone.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
            log::debug!("Playback thread exiting");
        });

        Ok(Self {
            queue,
            rendering,
            stop,
            capacity,
            config,
            thread: Some(thread),
        })
    }

    /// Queue little-endian 16-bit PCM for rendering. Fails with `BufferFull`
    /// when accepting the chunk would exceed the configured buffer; the caller
    /// logs and drops in that case, the pipeline keeps running.
    pub fn enqueue(&self, pcm: &[u8]) -> Result<(), AudioError> {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() + pcm.len() / 2 > self.capacity {
            return Err(AudioError::BufferFull);
        }

        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            queue.push_back(sample as f32 / i16::MAX as f32);
        }

        let percentage = (queue.len() * 100 / self.capacity) as u8;
        if percentage > self.config.high_watermark {
            log::warn!("Playback buffer high: {percentage}%");
        } else if percentage < self.config.low_watermark {
            log::debug!("Playback buffer low: {percentage}%");
        }
        Ok(())
    }

    /// Flush pending audio and stop rendering immediately. Used for barge-in
    /// and when a conversation ends with audio still queued.
    pub fn interrupt(&self) {
        let flushed = {
            let mut queue = self.queue.lock().unwrap();
            let len = queue.len();
            queue.clear();
            len
        };
        if flushed > 0 {
            log::info!("⏹ Playback interrupted, flushed {flushed} buffered samples");
        }
    }

    /// Whether the assistant is currently audible (samples queued or being
    /// rendered).
    pub fn is_active(&self) -> bool {
        self.rendering.load(Ordering::Acquire) || !self.queue.lock().unwrap().is_empty()
    }

    /// Queue a cue sound. A cue failing to fit is logged and skipped.
    pub fn play_cue(&self, cue: &Cue) {
        if let Err(e) = self.enqueue(&cue.to_pcm_bytes()) {
            log::warn!("Failed to queue cue sound: {e}");
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Playback thread panicked");
            }
        }
    }

    fn output_device(device_name: Option<&str>) -> Result<Device, AudioError> {
        let host = cpal::default_host();
        match device_name {
            Some(wanted) => {
                let devices = host
                    .output_devices()
                    .map_err(|e| AudioError::Device(format!("failed to enumerate outputs: {e}")))?;
                for device in devices {
                    let name = device
                        .name()
                        .map_err(|e| AudioError::Device(format!("failed to get device name: {e}")))?;
                    if name.contains(wanted) {
                        return Ok(device);
                    }
                }
                Err(AudioError::Device(format!(
                    "output device '{wanted}' not found"
                )))
            }
            None => host
                .default_output_device()
                .ok_or_else(|| AudioError::Device("no default output device".to_string())),
        }
    }

    /// List output device names for the `--list-devices` mode.
    pub fn list_output_devices() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::Device(format!("failed to enumerate outputs: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            names.push(
                device
                    .name()
                    .map_err(|e| AudioError::Device(format!("failed to get device name: {e}")))?,
            );
        }
        Ok(names)
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_interpolated(chunk: &[f32], out: &mut [f32], channels: usize, step: f32) {
    let mut pos = 0.0_f32;
    for frame in out.chunks_mut(channels) {
        let sample = if chunk.is_empty() {
            0.0
        } else {
            let i = pos as usize;
            let last = *chunk.last().unwrap();
            let s1 = chunk.get(i).copied().unwrap_or(last);
            let s2 = chunk.get(i + 1).copied().unwrap_or(last);
            let frac = pos.fract();
            s1 * (1.0 - frac) + s2 * frac
        };
        for channel in frame.iter_mut() {
            *channel = sample;
        }
        pos += step;
    }
}

/// A short notification sound, stored at the playback sample rate.
#[derive(Debug, Clone)]
pub struct Cue {
    samples: Vec<i16>,
}

impl Cue {
    /// Load a WAV file, downmixing stereo and resampling to `target_rate`.
    pub fn from_wav(path: &Path, target_rate: u32) -> Result<Self, AudioError> {
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| AudioError::Cue(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();

        let raw: Vec<i16> = reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::Cue(format!("{}: {e}", path.display())))?;

        let mono: Vec<i16> = if spec.channels == 2 {
            raw.chunks_exact(2)
                .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
                .collect()
        } else {
            raw
        };

        Ok(Self {
            samples: resample_linear(&mono, spec.sample_rate, target_rate),
        })
    }

    /// Synthesized fallback beep for missing cue files.
    pub fn beep(frequency: f32, duration_secs: f32, sample_rate: u32) -> Self {
        let count = (sample_rate as f32 * duration_secs) as usize;
        let samples = (0..count)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((2.0 * std::f32::consts::PI * frequency * t).sin() * 16_000.0) as i16
            })
            .collect();
        Self { samples }
    }

    fn to_pcm_bytes(&self) -> Vec<u8> {
        let mut pcm = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        pcm
    }
}

fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let step = from_rate as f32 / to_rate as f32;
    let out_len = (samples.len() as f32 / step) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f32 * step;
            let idx = pos as usize;
            let s1 = samples[idx.min(samples.len() - 1)] as f32;
            let s2 = samples[(idx + 1).min(samples.len() - 1)] as f32;
            (s1 + (s2 - s1) * pos.fract()) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_silence_when_queue_empty() {
        let mut out = vec![1.0_f32; 8];
        render_interpolated(&[], &mut out, 2, 0.5);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_render_duplicates_across_channels() {
        let chunk = vec![0.5_f32, 0.5, 0.5, 0.5];
        let mut out = vec![0.0_f32; 8];
        render_interpolated(&chunk, &mut out, 2, 1.0);
        for frame in out.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert!((out[0] - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_resample_identity() {
        let samples = vec![1, 2, 3, 4];
        assert_eq!(resample_linear(&samples, 24_000, 24_000), samples);
    }

    #[test]
    fn test_resample_halves_and_doubles_length() {
        let samples: Vec<i16> = (0..100).collect();
        let down = resample_linear(&samples, 48_000, 24_000);
        assert_eq!(down.len(), 50);
        let up = resample_linear(&samples, 24_000, 48_000);
        assert_eq!(up.len(), 200);
    }

    #[test]
    fn test_beep_cue_length_and_amplitude() {
        let cue = Cue::beep(800.0, 0.15, 24_000);
        assert_eq!(cue.samples.len(), 3_600);
        assert!(cue.samples.iter().any(|&s| s > 10_000));
        assert!(cue.samples.iter().all(|&s| s.abs() <= 16_000));
    }

    #[test]
    fn test_cue_from_wav_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cue.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..4_800 {
            writer.write_sample((i % 100) as i16).unwrap();
        }
        writer.finalize().unwrap();

        let cue = Cue::from_wav(&path, 24_000).unwrap();
        assert_eq!(cue.samples.len(), 2_400);
    }

    #[test]
    #[cfg_attr(not(feature = "test-audio"), ignore)]
    fn test_playback_against_default_device() {
        match AudioPlayback::start(AudioPlaybackConfig::default()) {
            Ok(mut playback) => {
                let cue = Cue::beep(440.0, 0.1, 24_000);
                playback.play_cue(&cue);
                assert!(playback.is_active());
                playback.interrupt();
                playback.stop();
            }
            Err(e) => {
                println!("Audio device not available in test environment: {e}");
            }
        }
    }
}
