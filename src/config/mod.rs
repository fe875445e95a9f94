//! Configuration management for winterfresh
//!
//! Every value resolves as env > TOML file > default.

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};

/// Default wake vocabulary, including common mis-hearings of the wake phrase
pub const DEFAULT_WAKE_WORDS: &[&str] = &[
    "winterfresh",
    "winter fresh",
    "when to fresh",
    "whent to fresh",
    "when a fresh",
    "when the fresh",
    "winner fresh",
    "winter fest",
];

/// Default stop-intent vocabulary (already normalized)
pub const DEFAULT_STOP_PHRASES: &[&str] = &[
    "stop",
    "goodbye",
    "bye",
    "bye bye",
    "good night",
    "thats all",
    "that is all",
    "go to sleep",
    "never mind",
    "nevermind",
    "stop listening",
    "winter fresh stop",
    "thank you goodbye",
];

/// Literal the chat model is told to emit when the user wants to stop
pub const DEFAULT_SHUTDOWN_SENTINEL: &str = "Going to sleep now.";

/// winterfresh configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Session timing and limits
    pub session: SessionConfig,

    /// Microphone capture pipeline
    pub capture: CaptureConfig,

    /// Speaker output
    pub playback: PlaybackConfig,

    /// Provider selection
    pub providers: ProviderConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Wake-word listener
    pub wake: ListenerConfig,

    /// Mid-session stop listener
    pub stop_listener: Option<ListenerConfig>,

    /// Spoken phrases and intent vocabularies
    pub phrases: PhraseConfig,

    /// Volume control
    pub mixer: MixerConfig,

    /// Directory for cached TTS audio
    pub cache_dir: PathBuf,
}

/// Session timing configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Continuous silence before the session goes to sleep
    pub idle_timeout: Duration,

    /// Inactivity window after which history is cleared
    pub history_expiry: Duration,

    /// User/assistant pairs kept in history
    pub max_turns: usize,

    /// Bound on a turn reaching the speaking phase
    pub turn_timeout: Duration,

    /// Consecutive failures before a full restart
    pub restart_threshold: u32,

    /// Pause after stopping children during a restart
    pub restart_grace: Duration,

    /// Pause between failed cycles
    pub error_backoff: Duration,

    /// Granularity of the recording monitor loop
    pub monitor_tick: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(8),
            history_expiry: Duration::from_secs(5 * 60),
            max_turns: 10,
            turn_timeout: Duration::from_secs(45),
            restart_threshold: 3,
            restart_grace: Duration::from_millis(1000),
            error_backoff: Duration::from_millis(500),
            monitor_tick: Duration::from_millis(100),
        }
    }
}

/// Capture pipeline configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Input device (platform default when `None`)
    pub device: Option<String>,

    /// Sample rate in Hz (mono, 16-bit)
    pub sample_rate: u32,

    /// Optional band-pass filter (low, high) in Hz
    pub band_pass: Option<(u32, u32)>,

    /// Optional gain in dB
    pub gain_db: Option<f32>,

    /// Silence amplitude threshold, percent of full scale
    pub silence_threshold: f32,

    /// Silence that ends a recording once sound has started
    pub silence_duration: Duration,

    /// Sound needed before the silence stage considers the recording started
    pub onset_duration: Duration,

    /// RMS threshold for voice activity (fraction of full scale)
    pub vad_threshold: f32,

    /// Bytes observed before the detector starts evaluating
    pub vad_min_bytes: usize,

    /// Hard cap on a single recording
    pub max_duration: Duration,

    /// Recordings shorter than this are never sent for transcription
    pub min_audio_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: 16_000,
            band_pass: Some((200, 3400)),
            gain_db: None,
            silence_threshold: 3.0,
            silence_duration: Duration::from_millis(1500),
            onset_duration: Duration::from_millis(100),
            vad_threshold: 0.02,
            vad_min_bytes: 1000,
            max_duration: Duration::from_secs(30),
            min_audio_bytes: 8000,
        }
    }
}

/// Playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Output device (platform default when `None`)
    pub device: Option<String>,

    /// Sample rate of synthesized PCM
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: 24_000,
        }
    }
}

/// STT backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttBackend {
    Whisper,
    Deepgram,
}

/// Chat backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatBackend {
    OpenAi,
    OpenRouter,
    Anthropic,
}

/// TTS backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsBackend {
    OpenAi,
    ElevenLabs,
}

impl FromStr for SttBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

impl FromStr for ChatBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "openrouter" => Ok(Self::OpenRouter),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(Error::Config(format!("unknown chat provider: {other}"))),
        }
    }
}

impl FromStr for TtsBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Provider selection
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub stt: SttBackend,
    pub stt_model: String,
    pub chat: ChatBackend,
    pub chat_model: String,
    pub chat_max_tokens: u32,
    pub tts: TtsBackend,
    pub tts_model: String,
    pub tts_voice: String,
    pub tts_speed: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            stt: SttBackend::Whisper,
            stt_model: "whisper-1".to_string(),
            chat: ChatBackend::OpenAi,
            chat_model: "gpt-4o-mini".to_string(),
            chat_max_tokens: 300,
            tts: TtsBackend::OpenAi,
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_speed: 1.0,
        }
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, chat, TTS)
    pub openai: Option<SecretString>,

    /// `Anthropic` API key (chat)
    pub anthropic: Option<SecretString>,

    /// `OpenRouter` API key (chat)
    pub openrouter: Option<SecretString>,

    /// `ElevenLabs` API key (TTS)
    pub elevenlabs: Option<SecretString>,

    /// `Deepgram` API key (STT)
    pub deepgram: Option<SecretString>,
}

/// A child process that prints a marker line when triggered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Program followed by its arguments
    pub command: Vec<String>,

    /// Token searched for in each stdout line
    pub marker: String,
}

impl ListenerConfig {
    /// Default wake listener: `python3 wake.py`, printing `WAKE`
    #[must_use]
    pub fn default_wake() -> Self {
        Self {
            command: vec!["python3".to_string(), "wake.py".to_string()],
            marker: "WAKE".to_string(),
        }
    }
}

/// Spoken phrases and intent vocabularies
#[derive(Debug, Clone)]
pub struct PhraseConfig {
    pub system_prompt: String,
    pub greeting: String,
    pub welcome_back: String,
    pub sleep: String,
    pub stop_phrases: Vec<String>,
    pub shutdown_sentinel: String,
    pub wake_words: Vec<String>,
}

impl Default for PhraseConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are Winterfresh, a friendly voice assistant. \
                Keep responses short and conversational; they will be spoken aloud."
                .to_string(),
            greeting: "Hey, what's up?".to_string(),
            welcome_back: "Welcome back. What else?".to_string(),
            sleep: "Okay, going to sleep.".to_string(),
            stop_phrases: DEFAULT_STOP_PHRASES.iter().map(ToString::to_string).collect(),
            shutdown_sentinel: DEFAULT_SHUTDOWN_SENTINEL.to_string(),
            wake_words: DEFAULT_WAKE_WORDS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl PhraseConfig {
    /// System turn sent with every chat request
    ///
    /// Appends the instruction to emit the shutdown sentinel verbatim.
    #[must_use]
    pub fn system_turn(&self) -> String {
        format!(
            "{}\n\nIf the user indicates they want to end the conversation, reply with exactly: \"{}\"",
            self.system_prompt, self.shutdown_sentinel
        )
    }

    /// Phrases worth caching because they are spoken every session
    #[must_use]
    pub fn canned(&self) -> Vec<String> {
        vec![
            self.greeting.clone(),
            self.welcome_back.clone(),
            self.sleep.clone(),
        ]
    }
}

/// Volume control configuration
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// ALSA card index
    pub card: String,

    /// Mixer control name
    pub control: String,

    /// Chime played after a volume change
    pub chime: Option<PathBuf>,

    /// Chime played while a turn is processed
    pub processing_chime: Option<PathBuf>,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            card: "2".to_string(),
            control: "PCM".to_string(),
            chime: None,
            processing_chime: None,
        }
    }
}

/// Return the cache directory for synthesized speech
///
/// Uses `~/.cache/winterfresh/tts` on Linux
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "winterfresh").map_or_else(
        || PathBuf::from(".cache/winterfresh/tts"),
        |d| d.cache_dir().join("tts"),
    )
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            providers: ProviderConfig::default(),
            api_keys: ApiKeys::default(),
            wake: ListenerConfig::default_wake(),
            stop_listener: None,
            phrases: PhraseConfig::default(),
            mixer: MixerConfig::default(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl Config {
    /// Load configuration from the standard locations
    ///
    /// # Errors
    ///
    /// Returns error if a provider name or override is invalid
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, reading the TOML overlay from `path` when given
    ///
    /// # Errors
    ///
    /// Returns error if a provider name or override is invalid
    #[allow(clippy::too_many_lines)]
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        // Load optional TOML config file (env > toml > default)
        let fc = file::load_config_file(path);

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            idle_timeout: seconds(
                "session.idle_timeout_secs",
                env_parse::<f64>("WINTERFRESH_IDLE_TIMEOUT_SECS")?.or(fc.session.idle_timeout_secs),
                session_defaults.idle_timeout,
            )?,
            history_expiry: env_parse::<u64>("WINTERFRESH_HISTORY_EXPIRY_SECS")?
                .or(fc.session.history_expiry_secs)
                .map_or(session_defaults.history_expiry, Duration::from_secs),
            max_turns: env_parse("WINTERFRESH_MAX_TURNS")?
                .or(fc.session.max_turns)
                .unwrap_or(session_defaults.max_turns),
            turn_timeout: fc
                .session
                .turn_timeout_secs
                .map_or(session_defaults.turn_timeout, Duration::from_secs),
            restart_threshold: fc
                .session
                .restart_threshold
                .unwrap_or(session_defaults.restart_threshold),
            restart_grace: fc
                .session
                .restart_grace_ms
                .map_or(session_defaults.restart_grace, Duration::from_millis),
            ..session_defaults
        };

        let capture_defaults = CaptureConfig::default();
        let capture = CaptureConfig {
            device: std::env::var("WINTERFRESH_CAPTURE_DEVICE")
                .ok()
                .or(fc.capture.device),
            sample_rate: fc
                .capture
                .sample_rate
                .unwrap_or(capture_defaults.sample_rate),
            band_pass: fc
                .capture
                .band_pass
                .map(|[low, high]| (low, high))
                .or(capture_defaults.band_pass),
            gain_db: fc.capture.gain_db,
            silence_threshold: fc
                .capture
                .silence_threshold
                .unwrap_or(capture_defaults.silence_threshold),
            silence_duration: seconds(
                "capture.silence_secs",
                fc.capture.silence_secs.map(f64::from),
                capture_defaults.silence_duration,
            )?,
            vad_threshold: env_parse("WINTERFRESH_VAD_THRESHOLD")?
                .or(fc.capture.vad_threshold)
                .unwrap_or(capture_defaults.vad_threshold),
            vad_min_bytes: fc
                .capture
                .vad_min_bytes
                .unwrap_or(capture_defaults.vad_min_bytes),
            max_duration: fc
                .capture
                .max_record_secs
                .map_or(capture_defaults.max_duration, Duration::from_secs),
            min_audio_bytes: fc
                .capture
                .min_audio_bytes
                .unwrap_or(capture_defaults.min_audio_bytes),
            ..capture_defaults
        };

        let playback = PlaybackConfig {
            device: std::env::var("WINTERFRESH_PLAYBACK_DEVICE")
                .ok()
                .or(fc.playback.device),
            sample_rate: fc
                .playback
                .sample_rate
                .unwrap_or(PlaybackConfig::default().sample_rate),
        };

        let provider_defaults = ProviderConfig::default();
        let providers = ProviderConfig {
            stt: pick(
                std::env::var("WINTERFRESH_STT_PROVIDER").ok(),
                fc.providers.stt,
            )?
            .unwrap_or(provider_defaults.stt),
            stt_model: std::env::var("WINTERFRESH_STT_MODEL")
                .ok()
                .or(fc.providers.stt_model)
                .unwrap_or(provider_defaults.stt_model),
            chat: pick(
                std::env::var("WINTERFRESH_CHAT_PROVIDER").ok(),
                fc.providers.chat,
            )?
            .unwrap_or(provider_defaults.chat),
            chat_model: std::env::var("WINTERFRESH_CHAT_MODEL")
                .ok()
                .or(fc.providers.chat_model)
                .unwrap_or(provider_defaults.chat_model),
            chat_max_tokens: fc
                .providers
                .chat_max_tokens
                .unwrap_or(provider_defaults.chat_max_tokens),
            tts: pick(
                std::env::var("WINTERFRESH_TTS_PROVIDER").ok(),
                fc.providers.tts,
            )?
            .unwrap_or(provider_defaults.tts),
            tts_model: std::env::var("WINTERFRESH_TTS_MODEL")
                .ok()
                .or(fc.providers.tts_model)
                .unwrap_or(provider_defaults.tts_model),
            tts_voice: std::env::var("WINTERFRESH_TTS_VOICE")
                .ok()
                .or(fc.providers.tts_voice)
                .unwrap_or(provider_defaults.tts_voice),
            tts_speed: fc.providers.tts_speed.unwrap_or(provider_defaults.tts_speed),
        };

        // Load API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: secret("OPENAI_API_KEY", fc.api_keys.openai),
            anthropic: secret("ANTHROPIC_API_KEY", fc.api_keys.anthropic),
            openrouter: secret("OPENROUTER_API_KEY", fc.api_keys.openrouter),
            elevenlabs: secret("ELEVENLABS_API_KEY", fc.api_keys.elevenlabs),
            deepgram: secret("DEEPGRAM_API_KEY", fc.api_keys.deepgram),
        };

        let wake_defaults = ListenerConfig::default_wake();
        let wake = ListenerConfig {
            command: std::env::var("WINTERFRESH_WAKE_COMMAND")
                .ok()
                .map(|c| split_command(&c))
                .or(fc.wake.command)
                .unwrap_or(wake_defaults.command),
            marker: fc.wake.marker.unwrap_or(wake_defaults.marker),
        };

        let stop_listener = std::env::var("WINTERFRESH_STOP_COMMAND")
            .ok()
            .map(|c| ListenerConfig {
                command: split_command(&c),
                marker: "SHUTDOWN".to_string(),
            })
            .or_else(|| {
                fc.stop_listener.and_then(|s| {
                    s.command.map(|command| ListenerConfig {
                        command,
                        marker: s.marker.unwrap_or_else(|| "SHUTDOWN".to_string()),
                    })
                })
            });

        let phrase_defaults = PhraseConfig::default();
        let phrases = PhraseConfig {
            system_prompt: fc
                .phrases
                .system_prompt
                .unwrap_or(phrase_defaults.system_prompt),
            greeting: fc.phrases.greeting.unwrap_or(phrase_defaults.greeting),
            welcome_back: fc
                .phrases
                .welcome_back
                .unwrap_or(phrase_defaults.welcome_back),
            sleep: fc.phrases.sleep.unwrap_or(phrase_defaults.sleep),
            stop_phrases: fc
                .phrases
                .stop_phrases
                .unwrap_or(phrase_defaults.stop_phrases),
            shutdown_sentinel: fc
                .phrases
                .shutdown_sentinel
                .unwrap_or(phrase_defaults.shutdown_sentinel),
            wake_words: fc.phrases.wake_words.unwrap_or(phrase_defaults.wake_words),
        };

        let mixer_defaults = MixerConfig::default();
        let mixer = MixerConfig {
            card: std::env::var("ALSA_CARD")
                .ok()
                .or(fc.mixer.card)
                .unwrap_or(mixer_defaults.card),
            control: fc.mixer.control.unwrap_or(mixer_defaults.control),
            chime: fc.mixer.chime.map(PathBuf::from),
            processing_chime: fc.mixer.processing_chime.map(PathBuf::from),
        };

        let cache_dir = std::env::var("WINTERFRESH_CACHE_DIR")
            .ok()
            .or(fc.cache_dir)
            .map_or_else(default_cache_dir, PathBuf::from);

        if session.max_turns == 0 {
            return Err(Error::Config("session.max_turns must be at least 1".to_string()));
        }

        Ok(Self {
            session,
            capture,
            playback,
            providers,
            api_keys,
            wake,
            stop_listener,
            phrases,
            mixer,
            cache_dir,
        })
    }
}

/// Parse an optional environment override
fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}

/// Resolve a provider name from env or file
fn pick<T: FromStr<Err = Error>>(env: Option<String>, file: Option<String>) -> Result<Option<T>> {
    env.or(file).map(|name| name.parse()).transpose()
}

/// Convert a fractional seconds value, rejecting negative and non-finite input
fn seconds(name: &str, value: Option<f64>, default: Duration) -> Result<Duration> {
    value.map_or(Ok(default), |secs| {
        Duration::try_from_secs_f64(secs)
            .map_err(|_| Error::Config(format!("invalid duration for {name}: {secs}")))
    })
}

fn secret(env_name: &str, file_value: Option<String>) -> Option<SecretString> {
    std::env::var(env_name)
        .ok()
        .or(file_value)
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_seconds_rejected() {
        let default = Duration::from_secs(8);
        assert_eq!(seconds("idle", None, default).unwrap(), default);
        assert_eq!(
            seconds("idle", Some(2.5), default).unwrap(),
            Duration::from_millis(2500)
        );
        assert!(matches!(seconds("idle", Some(-1.0), default), Err(Error::Config(_))));
        assert!(matches!(seconds("idle", Some(f64::NAN), default), Err(Error::Config(_))));
        assert!(matches!(
            seconds("idle", Some(f64::INFINITY), default),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn provider_names_parse() {
        assert_eq!("Deepgram".parse::<SttBackend>().unwrap(), SttBackend::Deepgram);
        assert_eq!("anthropic".parse::<ChatBackend>().unwrap(), ChatBackend::Anthropic);
        assert_eq!("elevenlabs".parse::<TtsBackend>().unwrap(), TtsBackend::ElevenLabs);
        assert!("festival".parse::<TtsBackend>().is_err());
    }

    #[test]
    fn system_turn_carries_sentinel() {
        let phrases = PhraseConfig::default();
        assert!(phrases.system_turn().contains(DEFAULT_SHUTDOWN_SENTINEL));
    }

    #[test]
    fn canned_phrases_include_sleep() {
        let phrases = PhraseConfig::default();
        assert!(phrases.canned().contains(&phrases.sleep));
        assert_eq!(phrases.canned().len(), 3);
    }

    #[test]
    fn split_command_on_whitespace() {
        assert_eq!(
            split_command("python3  wake.py --device 2"),
            vec!["python3", "wake.py", "--device", "2"]
        );
    }

    #[test]
    fn session_defaults() {
        let session = SessionConfig::default();
        assert_eq!(session.max_turns, 10);
        assert!(session.history_expiry > session.idle_timeout);
    }
}
