//! Error types for winterfresh

use thiserror::Error;

/// Result type alias for winterfresh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice loop
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio encoding or format error
    #[error("audio error: {0}")]
    Audio(String),

    /// Capture pipeline error (spawn failure, device unavailable)
    #[error("capture error: {0}")]
    Capture(String),

    /// Playback process error
    #[error("playback error: {0}")]
    Playback(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Chat completion error
    #[error("chat error: {0}")]
    Chat(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Wake or stop listener error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// TTS cache error
    #[error("cache error: {0}")]
    Cache(String),

    /// Startup check failed
    #[error("preflight failed: {0}")]
    Preflight(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}
