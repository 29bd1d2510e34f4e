use super::{AudioError, AudioFrame};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SupportedStreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct AudioCaptureConfig {
    pub device_name: Option<String>,
    pub sample_rate: u32,
    pub chunk_size: usize,
    pub queue_capacity: usize,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 16_000,
            chunk_size: 512,
            queue_capacity: 64,
        }
    }
}

/// Microphone capture. The cpal stream lives on its own thread and publishes
/// fixed-size frames into a bounded broadcast channel; a subscriber that falls
/// behind loses the oldest frames and sees `RecvError::Lagged` with the count,
/// which callers log.
pub struct AudioCapture {
    tx: broadcast::Sender<AudioFrame>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AudioCapture {
    pub fn start(config: AudioCaptureConfig) -> Result<Self, AudioError> {
        let (tx, _) = broadcast::channel(config.queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));

        // Resolve the device up front so startup errors are fatal and visible
        // instead of surfacing later on the capture thread.
        let device = Self::input_device(config.device_name.as_deref())?;
        let device_name = device
            .name()
            .map_err(|e| AudioError::Device(format!("failed to get device name: {e}")))?;
        let stream_config = Self::negotiate_config(&device, config.sample_rate)?;
        log::info!(
            "🎤 Audio capture: device '{}', {} Hz, {} channels, {}-sample frames",
            device_name,
            stream_config.sample_rate().0,
            stream_config.channels(),
            config.chunk_size
        );

        let tx_clone = tx.clone();
        let stop_clone = Arc::clone(&stop);
        let chunk_size = config.chunk_size;
        let channels = stream_config.channels() as usize;

        let thread = thread::spawn(move || {
            let stream = match Self::build_stream(&device, &stream_config, channels, chunk_size, tx_clone)
            {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Failed to build capture stream: {e}");
                    return;
                }
            };

            if let Err(e) = stream.play() {
                log::error!("Failed to start capture stream: {e}");
                return;
            }

            while !stop_clone.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
            log::debug!("Capture thread exiting");
        });

        Ok(Self {
            tx,
            stop,
            thread: Some(thread),
        })
    }

    /// Subscribe to the frame stream. Each subscriber gets every frame from
    /// its subscription point onward, in capture order.
    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.tx.subscribe()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }

    fn input_device(device_name: Option<&str>) -> Result<Device, AudioError> {
        let host = cpal::default_host();
        match device_name {
            Some(wanted) => {
                let devices = host
                    .input_devices()
                    .map_err(|e| AudioError::Device(format!("failed to enumerate inputs: {e}")))?;
                for device in devices {
                    let name = device
                        .name()
                        .map_err(|e| AudioError::Device(format!("failed to get device name: {e}")))?;
                    if name.contains(wanted) {
                        return Ok(device);
                    }
                }
                Err(AudioError::Device(format!(
                    "input device '{wanted}' not found"
                )))
            }
            None => host
                .default_input_device()
                .ok_or_else(|| AudioError::Device("no default input device".to_string())),
        }
    }

    /// Prefer mono at the requested rate; fall back to whatever channel count
    /// the device supports at that rate (channel 0 is extracted).
    fn negotiate_config(
        device: &Device,
        sample_rate: u32,
    ) -> Result<SupportedStreamConfig, AudioError> {
        let supported: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| AudioError::Device(format!("failed to query input configs: {e}")))?
            .collect();

        for range in &supported {
            if range.channels() == 1
                && range.min_sample_rate().0 <= sample_rate
                && range.max_sample_rate().0 >= sample_rate
            {
                return Ok(range.with_sample_rate(cpal::SampleRate(sample_rate)));
            }
        }
        for range in &supported {
            if range.min_sample_rate().0 <= sample_rate && range.max_sample_rate().0 >= sample_rate
            {
                let config = range.with_sample_rate(cpal::SampleRate(sample_rate));
                log::info!(
                    "No mono input config at {} Hz, using {} channels",
                    sample_rate,
                    config.channels()
                );
                return Ok(config);
            }
        }

        Err(AudioError::Device(format!(
            "no input configuration supports {sample_rate} Hz"
        )))
    }

    fn build_stream(
        device: &Device,
        config: &SupportedStreamConfig,
        channels: usize,
        chunk_size: usize,
        tx: broadcast::Sender<AudioFrame>,
    ) -> Result<cpal::Stream, AudioError> {
        let stream_config = config.config();

        let stream = match config.sample_format() {
            SampleFormat::I16 => {
                let mut framer = Framer::new(channels, chunk_size, tx);
                device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            framer.push(data.iter().copied());
                        },
                        |err| log::error!("Capture stream error: {err}"),
                        None,
                    )
                    .map_err(|e| AudioError::Stream(format!("failed to build i16 stream: {e}")))?
            }
            SampleFormat::F32 => {
                let mut framer = Framer::new(channels, chunk_size, tx);
                device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            framer.push(
                                data.iter()
                                    .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                            );
                        },
                        |err| log::error!("Capture stream error: {err}"),
                        None,
                    )
                    .map_err(|e| AudioError::Stream(format!("failed to build f32 stream: {e}")))?
            }
            SampleFormat::U16 => {
                let mut framer = Framer::new(channels, chunk_size, tx);
                device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[u16], _: &cpal::InputCallbackInfo| {
                            framer.push(
                                data.iter()
                                    .map(|&s| (s as i32 - (u16::MAX as i32 + 1) / 2) as i16),
                            );
                        },
                        |err| log::error!("Capture stream error: {err}"),
                        None,
                    )
                    .map_err(|e| AudioError::Stream(format!("failed to build u16 stream: {e}")))?
            }
            other => {
                return Err(AudioError::Stream(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        };

        Ok(stream)
    }

    /// List input device names for the `--list-devices` mode.
    pub fn list_input_devices() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::Device(format!("failed to enumerate inputs: {e}")))?;

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

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accumulates interleaved device samples into fixed-size mono frames,
/// extracting channel 0 and stamping sequence numbers.
struct Framer {
    channels: usize,
    chunk_size: usize,
    pending: Vec<i16>,
    seq: u64,
    tx: broadcast::Sender<AudioFrame>,
}

impl Framer {
    fn new(channels: usize, chunk_size: usize, tx: broadcast::Sender<AudioFrame>) -> Self {
        Self {
            channels,
            chunk_size,
            pending: Vec::with_capacity(chunk_size),
            seq: 0,
            tx,
        }
    }

    fn push(&mut self, samples: impl Iterator<Item = i16>) {
        for (i, sample) in samples.enumerate() {
            if i % self.channels != 0 {
                continue;
            }
            self.pending.push(sample);
            if self.pending.len() == self.chunk_size {
                let frame = AudioFrame {
                    seq: self.seq,
                    samples: std::mem::replace(
                        &mut self.pending,
                        Vec::with_capacity(self.chunk_size),
                    ),
                };
                self.seq += 1;
                // No receivers is fine; frames are simply discarded.
                let _ = self.tx.send(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_emits_fixed_chunks_in_order() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut framer = Framer::new(1, 4, tx);

        framer.push((0..10).map(|i| i as i16));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(first.samples, vec![0, 1, 2, 3]);
        assert_eq!(second.seq, 1);
        assert_eq!(second.samples, vec![4, 5, 6, 7]);
        // Two samples remain pending, no third frame yet.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_framer_extracts_channel_zero() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut framer = Framer::new(2, 3, tx);

        // Interleaved stereo: channel 0 = 10, 20, 30
        framer.push(vec![10, -1, 20, -2, 30, -3].into_iter());

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.samples, vec![10, 20, 30]);
    }

    #[test]
    fn test_lagged_subscriber_loses_oldest() {
        let (tx, mut rx) = broadcast::channel(2);
        let mut framer = Framer::new(1, 1, tx);

        framer.push(vec![1, 2, 3, 4].into_iter());

        // Capacity 2: the two oldest frames are gone, receiver reports the gap.
        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert_eq!(n, 2),
            other => panic!("expected lagged error, got {other:?}"),
        }
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.seq, 2);
    }

    #[test]
    #[cfg_attr(not(feature = "test-audio"), ignore)]
    fn test_capture_from_default_device() {
        let capture = AudioCapture::start(AudioCaptureConfig::default());
        match capture {
            Ok(mut capture) => {
                let _rx = capture.subscribe();
                capture.stop();
            }
            Err(e) => {
                println!("Audio device not available in test environment: {e}");
            }
        }
    }
}
