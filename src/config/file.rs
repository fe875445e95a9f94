//! TOML configuration file loading
//!
//! Supports `~/.config/winterfresh/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct WinterfreshConfigFile {
    /// Session timing and limits
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Microphone capture pipeline
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Speaker output
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// STT, chat and TTS provider selection
    #[serde(default)]
    pub providers: ProvidersFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Wake-word listener process
    #[serde(default)]
    pub wake: ListenerFileConfig,

    /// Optional mid-session stop listener process
    #[serde(default)]
    pub stop_listener: Option<ListenerFileConfig>,

    /// Spoken phrases and intent vocabularies
    #[serde(default)]
    pub phrases: PhrasesFileConfig,

    /// Volume control
    #[serde(default)]
    pub mixer: MixerFileConfig,

    /// Directory for cached TTS audio
    pub cache_dir: Option<String>,
}

/// Session timing configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Seconds of silence before the session goes to sleep
    pub idle_timeout_secs: Option<f64>,

    /// Seconds of inactivity before conversation history is cleared
    pub history_expiry_secs: Option<u64>,

    /// Number of user/assistant pairs kept in history
    pub max_turns: Option<usize>,

    /// Seconds a turn may spend before speaking starts
    pub turn_timeout_secs: Option<u64>,

    /// Consecutive failures before a full restart
    pub restart_threshold: Option<u32>,

    /// Grace delay after stopping children during restart (ms)
    pub restart_grace_ms: Option<u64>,
}

/// Capture pipeline configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Input device name (e.g. `plughw:2,0`)
    pub device: Option<String>,
    /// Capture sample rate in Hz
    pub sample_rate: Option<u32>,
    /// Band-pass filter as `[low_hz, high_hz]`
    pub band_pass: Option<[u32; 2]>,
    /// Gain applied in the filter stage (dB)
    pub gain_db: Option<f32>,
    /// Silence amplitude threshold (percent of full scale)
    pub silence_threshold: Option<f32>,
    /// Seconds of silence that end a recording
    pub silence_secs: Option<f32>,
    /// RMS threshold for voice activity (0.0 - 1.0)
    pub vad_threshold: Option<f32>,
    /// Bytes to observe before VAD evaluates
    pub vad_min_bytes: Option<usize>,
    /// Hard cap on a single recording (seconds)
    pub max_record_secs: Option<u64>,
    /// Recordings shorter than this are never transcribed
    pub min_audio_bytes: Option<usize>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Output device name
    pub device: Option<String>,
    /// Sample rate of synthesized audio
    pub sample_rate: Option<u32>,
}

/// Provider selection
#[derive(Debug, Default, Deserialize)]
pub struct ProvidersFileConfig {
    /// "whisper" or "deepgram"
    pub stt: Option<String>,
    /// STT model
    pub stt_model: Option<String>,
    /// "openai", "openrouter" or "anthropic"
    pub chat: Option<String>,
    /// Chat model
    pub chat_model: Option<String>,
    /// Max tokens per reply
    pub chat_max_tokens: Option<u32>,
    /// "openai" or "elevenlabs"
    pub tts: Option<String>,
    /// TTS model
    pub tts_model: Option<String>,
    /// TTS voice identifier
    pub tts_voice: Option<String>,
    /// TTS speed multiplier
    pub tts_speed: Option<f32>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub openrouter: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
}

/// Marker-line listener process
#[derive(Debug, Default, Deserialize)]
pub struct ListenerFileConfig {
    /// Program and arguments
    pub command: Option<Vec<String>>,
    /// Token printed on stdout when triggered
    pub marker: Option<String>,
}

/// Spoken phrases
#[derive(Debug, Default, Deserialize)]
pub struct PhrasesFileConfig {
    pub system_prompt: Option<String>,
    pub greeting: Option<String>,
    pub welcome_back: Option<String>,
    pub sleep: Option<String>,
    pub stop_phrases: Option<Vec<String>>,
    pub shutdown_sentinel: Option<String>,
    pub wake_words: Option<Vec<String>>,
}

/// Volume control configuration
#[derive(Debug, Default, Deserialize)]
pub struct MixerFileConfig {
    /// ALSA card index
    pub card: Option<String>,
    /// Mixer control name
    pub control: Option<String>,
    /// Chime played after a volume change
    pub chime: Option<String>,
    /// Chime played while a turn is being processed
    pub processing_chime: Option<String>,
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `WinterfreshConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> WinterfreshConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return WinterfreshConfigFile::default();
    };

    if !path.exists() {
        return WinterfreshConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                WinterfreshConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            WinterfreshConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/winterfresh/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "winterfresh")
        .map(|d| d.config_dir().join("config.toml"))
}
