use clap::Parser;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voice_assistant::assistant::Assistant;
use voice_assistant::audio::{
    AudioCapture, AudioCaptureConfig, AudioPlayback, AudioPlaybackConfig, Cue,
};
use voice_assistant::config::Config;
use voice_assistant::error::Result as AssistantResult;
use voice_assistant::wakeword::{RustpotterEngine, WakewordDetector};

#[derive(Parser, Debug)]
#[command(
    name = "voice-assistant",
    about = "Wakeword-activated voice assistant with a native-audio conversation backend"
)]
struct Cli {
    /// List available audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Test audio input and output, then exit
    #[arg(long)]
    test_audio: bool,

    /// Test wakeword detection, then exit
    #[arg(long)]
    test_wakeword: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> AssistantResult<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if cli.list_devices {
        return list_devices();
    }
    if cli.test_audio {
        return test_audio().await;
    }
    if cli.test_wakeword {
        return test_wakeword().await;
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            log::error!("Set the missing variables in the environment or a .env file");
            return Err(e.into());
        }
    };

    let mut assistant = Assistant::new(config)?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl+C, shutting down...");
            signal_token.cancel();
        }
    });

    println!("🎧 Listening... say the wakeword to start a conversation (Ctrl+C to exit)");
    assistant.run(shutdown).await?;
    println!("👋 Goodbye!");
    Ok(())
}

fn list_devices() -> AssistantResult<()> {
    println!("\n=== Audio input devices ===");
    for name in AudioCapture::list_input_devices()? {
        println!("  {name}");
    }

    println!("\n=== Audio output devices ===");
    for name in AudioPlayback::list_output_devices()? {
        println!("  {name}");
    }

    println!("\nTip: set AUDIO_INPUT_DEVICE and AUDIO_OUTPUT_DEVICE in .env");
    Ok(())
}

/// Plays two beeps, then records a few seconds and reports the peak level.
async fn test_audio() -> AssistantResult<()> {
    println!("\n=== Audio test ===");

    println!("\n1. Testing output (two beeps)...");
    let playback = AudioPlayback::start(AudioPlaybackConfig::default())?;
    playback.play_cue(&Cue::beep(440.0, 0.3, 24_000));
    playback.play_cue(&Cue::beep(880.0, 0.3, 24_000));
    while playback.is_active() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    println!("   ✓ Output works");

    println!("\n2. Testing input (3 seconds), say something...");
    let capture = AudioCapture::start(AudioCaptureConfig::default())?;
    let mut frames = capture.subscribe();
    let mut peak: i16 = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, frames.recv()).await {
            Ok(Ok(frame)) => {
                peak = peak.max(frame.samples.iter().map(|s| s.saturating_abs()).max().unwrap_or(0));
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }

    println!("   Peak amplitude: {peak}");
    if peak > 1_000 {
        println!("   ✓ Input works");
    } else {
        println!("   ⚠ Very quiet signal - check the microphone");
    }
    println!("\n=== Test complete ===");
    Ok(())
}

/// Runs the wakeword pipeline against the live microphone until the phrase
/// is detected or Ctrl+C.
async fn test_wakeword() -> AssistantResult<()> {
    let config = Config::load()?;

    println!("\n=== Wakeword test ===");
    let engine = RustpotterEngine::new(&config.wakeword, config.audio.sample_rate)?;
    let mut detector = WakewordDetector::new(Box::new(engine), config.wakeword.refractory);

    let capture = AudioCapture::start(AudioCaptureConfig {
        device_name: config.audio.input_device.clone(),
        sample_rate: config.audio.sample_rate,
        chunk_size: config.audio.chunk_size,
        queue_capacity: config.audio.queue_capacity,
    })?;
    let mut frames = capture.subscribe();

    println!("Say the wakeword to test detection (Ctrl+C to exit)\n");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nAborted");
                break;
            }
            result = frames.recv() => match result {
                Ok(frame) => {
                    if let Some(event) = detector.process_frame(&frame.samples)? {
                        println!("\n✓ Wakeword detected (confidence: {:.2})", event.confidence);
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Dropped {n} frame(s)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}
