use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

/// Audio device and framing configuration.
///
/// Capture runs at the wakeword/model input rate (16 kHz mono); the model
/// answers at 24 kHz mono, which is what playback renders.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: u32,
    pub chunk_size: usize,
    pub playback_sample_rate: u32,
    pub queue_capacity: usize,
}

/// Wakeword engine configuration.
#[derive(Debug, Clone)]
pub struct WakewordConfig {
    pub model_path: PathBuf,
    pub sensitivity: f32,
    pub refractory: Duration,
}

/// Configuration for the duplex conversation backend.
#[derive(Debug)]
pub struct LiveConfig {
    pub api_key: SecretBox<String>,
    pub model: String,
    pub voice: String,
    pub ws_url: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

impl LiveConfig {
    /// Expose the API key (use only when opening a session).
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

/// Calendar API credentials. Present only when the calendar tool is enabled
/// and fully configured.
#[derive(Debug)]
pub struct CalendarConfig {
    pub client_id: String,
    pub client_secret: SecretBox<String>,
    pub refresh_token: SecretBox<String>,
    pub calendar_id: String,
}

impl CalendarConfig {
    pub fn client_secret(&self) -> &str {
        self.client_secret.expose_secret()
    }

    pub fn refresh_token(&self) -> &str {
        self.refresh_token.expose_secret()
    }
}

/// Conversation policy and user-facing settings.
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub name: String,
    pub system_prompt: String,
    pub follow_up_window: Duration,
    pub conversation_timeout: Duration,
    pub vad_threshold: f32,
    pub sounds_dir: PathBuf,
    pub activation_sound: String,
    pub deactivation_sound: String,
}

#[derive(Debug)]
pub struct Config {
    pub audio: AudioConfig,
    pub wakeword: WakewordConfig,
    pub live: LiveConfig,
    pub calendar: Option<CalendarConfig>,
    pub assistant: AssistantConfig,
}

impl Config {
    /// Load configuration from environment variables. A `.env` file in the
    /// working directory is honored for development setups.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let name = env_or("ASSISTANT_NAME", "Computer");

        let audio = AudioConfig {
            input_device: env_optional("AUDIO_INPUT_DEVICE"),
            output_device: env_optional("AUDIO_OUTPUT_DEVICE"),
            sample_rate: env_parse("AUDIO_SAMPLE_RATE", 16_000)?,
            chunk_size: env_parse("AUDIO_CHUNK_SIZE", 512)?,
            playback_sample_rate: env_parse("AUDIO_PLAYBACK_SAMPLE_RATE", 24_000)?,
            queue_capacity: env_parse("AUDIO_QUEUE_CAPACITY", 64)?,
        };

        let wakeword = WakewordConfig {
            model_path: PathBuf::from(env_required("WAKEWORD_MODEL_PATH")?),
            sensitivity: env_parse("WAKEWORD_SENSITIVITY", 0.5_f32)?,
            refractory: Duration::from_millis(env_parse("WAKEWORD_REFRACTORY_MS", 2_000_u64)?),
        };
        if !(0.0..=1.0).contains(&wakeword.sensitivity) {
            return Err(ConfigError::InvalidValue {
                var: "WAKEWORD_SENSITIVITY".to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }

        let live = LiveConfig {
            api_key: load_secret("GEMINI_API_KEY")?,
            model: env_or("GEMINI_MODEL", "gemini-2.5-flash-native-audio-preview-12-2025"),
            voice: env_or("GEMINI_VOICE", "Aoede"),
            ws_url: env_or(
                "GEMINI_WS_URL",
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent",
            ),
            input_sample_rate: audio.sample_rate,
            output_sample_rate: audio.playback_sample_rate,
        };

        let calendar = Self::load_calendar()?;

        let assistant = AssistantConfig {
            system_prompt: env_optional("SYSTEM_PROMPT")
                .unwrap_or_else(|| default_system_prompt(&name)),
            name,
            follow_up_window: Duration::from_secs(env_parse("FOLLOW_UP_WINDOW_SECS", 6_u64)?),
            conversation_timeout: Duration::from_secs(env_parse(
                "CONVERSATION_TIMEOUT_SECS",
                30_u64,
            )?),
            vad_threshold: env_parse("VAD_THRESHOLD", 0.5_f32)?,
            sounds_dir: PathBuf::from(env_or("SOUNDS_DIR", "sounds")),
            activation_sound: env_or("ACTIVATION_SOUND", "activation.wav"),
            deactivation_sound: env_or("DEACTIVATION_SOUND", "deactivation.wav"),
        };

        Ok(Self {
            audio,
            wakeword,
            live,
            calendar,
            assistant,
        })
    }

    /// Calendar credentials are optional: the assistant runs without the
    /// calendar tool when they are absent or the integration is disabled.
    fn load_calendar() -> Result<Option<CalendarConfig>, ConfigError> {
        let enabled = env_parse("GOOGLE_CALENDAR_ENABLED", true)?;
        if !enabled {
            return Ok(None);
        }

        let client_id = env_optional("GOOGLE_CLIENT_ID");
        let client_secret = env_optional("GOOGLE_CLIENT_SECRET");
        let refresh_token = env_optional("GOOGLE_REFRESH_TOKEN");

        match (client_id, client_secret, refresh_token) {
            (Some(client_id), Some(secret), Some(token)) => Ok(Some(CalendarConfig {
                client_id,
                client_secret: SecretBox::new(Box::new(secret)),
                refresh_token: SecretBox::new(Box::new(token)),
                calendar_id: env_or("GOOGLE_CALENDAR_ID", "primary"),
            })),
            (None, None, None) => {
                log::info!("Starting without calendar tool (no Google credentials configured)");
                Ok(None)
            }
            _ => Err(ConfigError::InvalidValue {
                var: "GOOGLE_CLIENT_ID/GOOGLE_CLIENT_SECRET/GOOGLE_REFRESH_TOKEN".to_string(),
                reason: "calendar credentials must be configured together".to_string(),
            }),
        }
    }
}

fn default_system_prompt(name: &str) -> String {
    format!(
        "You are a helpful voice assistant named {name}. Answer in natural spoken \
         language and keep responses short, since they are read out loud.\n\n\
         You can manage the user's calendar: list, create, update, delete and \
         search events. Use the available tools whenever the user asks about \
         appointments or scheduling.\n\n\
         IMPORTANT: when the user ends the conversation (for example 'thanks', \
         'bye', 'that's all'), call the end_conversation tool immediately \
         without saying goodbye - a confirmation sound is played automatically."
    )
}

fn env_optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(var: &str, default: &str) -> String {
    env_optional(var).unwrap_or_else(|| default.to_string())
}

fn env_required(var: &str) -> Result<String, ConfigError> {
    env_optional(var).ok_or_else(|| ConfigError::MissingEnvVar(var.to_string()))
}

fn env_parse<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(var) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: format!("{e}"),
        }),
        None => Ok(default),
    }
}

fn load_secret(var: &str) -> Result<SecretBox<String>, ConfigError> {
    let key = env_required(var)?;
    Ok(SecretBox::new(Box::new(key)))
}
