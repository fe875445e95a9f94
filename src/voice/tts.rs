//! Text-to-speech (TTS) processing
//!
//! Both backends are asked for raw 24kHz 16-bit mono PCM so the audio can be
//! piped to the player while it downloads.

use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};

use crate::config::{Config, TtsBackend};
use crate::{Error, Result};

/// Chunks of synthesized PCM, in order
pub type AudioStream = BoxStream<'static, Result<Vec<u8>>>;

/// Turns text into streamed audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Voice identifier, part of the cache key
    fn voice(&self) -> &str;

    /// Start synthesizing `text`
    ///
    /// # Errors
    ///
    /// Returns error if the provider rejects the request
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;
}

/// Synthesizes speech over a hosted TTS API
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    speed: f32,
    model: String,
    backend: TtsBackend,
}

impl TextToSpeech {
    /// Create a new TTS instance using `OpenAI`
    #[must_use]
    pub fn new_openai(api_key: SecretString, voice: String, speed: f32, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            speed,
            model,
            backend: TtsBackend::OpenAi,
        }
    }

    /// Create a new TTS instance using ElevenLabs
    #[must_use]
    pub fn new_elevenlabs(api_key: SecretString, voice_id: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            voice: voice_id,
            speed: 1.0, // ElevenLabs doesn't use speed in the same way
            model,
            backend: TtsBackend::ElevenLabs,
        }
    }

    /// Create the configured TTS backend
    ///
    /// # Errors
    ///
    /// Returns error if the backend's API key is missing
    pub fn from_config(config: &Config) -> Result<Self> {
        let p = &config.providers;
        match p.tts {
            TtsBackend::OpenAi => {
                let key = config.api_keys.openai.clone().ok_or_else(|| {
                    Error::Config("OpenAI API key required for TTS".to_string())
                })?;
                Ok(Self::new_openai(
                    key,
                    p.tts_voice.clone(),
                    p.tts_speed,
                    p.tts_model.clone(),
                ))
            }
            TtsBackend::ElevenLabs => {
                let key = config.api_keys.elevenlabs.clone().ok_or_else(|| {
                    Error::Config("ElevenLabs API key required for TTS".to_string())
                })?;
                let model = if p.tts_model.starts_with("tts-") {
                    "eleven_turbo_v2_5".to_string()
                } else {
                    p.tts_model.clone()
                };
                Ok(Self::new_elevenlabs(key, p.tts_voice.clone(), model))
            }
        }
    }

    /// Synthesize using OpenAI TTS
    async fn request_openai(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "pcm",
        };

        Ok(self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?)
    }

    /// Synthesize using ElevenLabs TTS
    async fn request_elevenlabs(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}/stream?output_format=pcm_24000",
            self.voice
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        Ok(self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?)
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    fn voice(&self) -> &str {
        &self.voice
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        let started = Instant::now();

        let response = match self.backend {
            TtsBackend::OpenAi => self.request_openai(text).await?,
            TtsBackend::ElevenLabs => self.request_elevenlabs(text).await?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("{:?} TTS error {status}: {body}", self.backend)));
        }

        tracing::debug!(
            first_byte_ms = started.elapsed().as_millis(),
            chars = text.len(),
            "TTS response started"
        );

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from))
            .boxed())
    }
}
