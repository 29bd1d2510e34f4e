use thiserror::Error;

pub type Result<T> = std::result::Result<T, AssistantError>;

/// Top-level error for the assistant binary. Module errors convert into this
/// at the orchestration boundary; recoverable conditions (session drops, tool
/// failures) are handled locally and never reach it.
#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("Audio error: {0}")]
    Audio(#[from] crate::audio::AudioError),

    #[error("Wakeword error: {0}")]
    Wakeword(#[from] crate::wakeword::WakewordError),

    #[error("Speech detection error: {0}")]
    Vad(#[from] crate::vad::VadError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
