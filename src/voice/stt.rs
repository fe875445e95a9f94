//! Speech-to-text (STT) processing

use std::time::Instant;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::wav::check_wav;
use crate::config::{Config, SttBackend};
use crate::{Error, Result};

/// Turns recorded audio into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a WAV recording
    ///
    /// Returns empty text when nothing usable was said.
    ///
    /// # Errors
    ///
    /// Returns error if the provider request fails
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Whether a recording is worth sending to a provider
///
/// Recordings below `min_bytes` are too short to hold speech.
#[must_use]
pub fn is_transcribable(audio: &[u8], min_bytes: usize) -> bool {
    if audio.len() < min_bytes {
        tracing::debug!(audio_bytes = audio.len(), min_bytes, "recording below length floor");
        return false;
    }
    if let Err(e) = check_wav(audio) {
        tracing::warn!(error = %e, "recording rejected before transcription");
        return false;
    }
    true
}

/// Transcribes speech over a hosted STT API
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    backend: SttBackend,
    min_audio_bytes: usize,
}

impl SpeechToText {
    /// Create a new STT instance using `OpenAI` Whisper
    #[must_use]
    pub fn new_whisper(api_key: SecretString, model: String, min_audio_bytes: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            backend: SttBackend::Whisper,
            min_audio_bytes,
        }
    }

    /// Create a new STT instance using Deepgram
    #[must_use]
    pub fn new_deepgram(api_key: SecretString, model: String, min_audio_bytes: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            backend: SttBackend::Deepgram,
            min_audio_bytes,
        }
    }

    /// Create the configured STT backend
    ///
    /// # Errors
    ///
    /// Returns error if the backend's API key is missing
    pub fn from_config(config: &Config) -> Result<Self> {
        let min = config.capture.min_audio_bytes;
        let model = config.providers.stt_model.clone();

        match config.providers.stt {
            SttBackend::Whisper => {
                let key = config.api_keys.openai.clone().ok_or_else(|| {
                    Error::Config("OpenAI API key required for Whisper".to_string())
                })?;
                Ok(Self::new_whisper(key, model, min))
            }
            SttBackend::Deepgram => {
                let key = config
                    .api_keys
                    .deepgram
                    .clone()
                    .ok_or_else(|| Error::Config("Deepgram API key required".to_string()))?;
                // whisper-1 means nothing to Deepgram
                let model = if model == "whisper-1" { "nova-2".to_string() } else { model };
                Ok(Self::new_deepgram(key, model, min))
            }
        }
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&punctuate=true",
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;

        Ok(result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        if !is_transcribable(audio, self.min_audio_bytes) {
            return Ok(String::new());
        }

        let started = Instant::now();
        let text = match self.backend {
            SttBackend::Whisper => self.transcribe_whisper(audio).await,
            SttBackend::Deepgram => self.transcribe_deepgram(audio).await,
        }
        .inspect_err(|e| tracing::warn!(error = %e, "transcription failed"))?;

        let text = text.trim().to_string();
        tracing::info!(
            transcript = %text,
            elapsed_ms = started.elapsed().as_millis(),
            "transcription complete"
        );
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::wav::pcm_to_wav;

    #[test]
    fn short_recordings_are_screened_out() {
        let wav = pcm_to_wav(&[0u8; 200], 16_000).unwrap();
        assert!(!is_transcribable(&wav, 8000));
        assert!(is_transcribable(&wav, 0));
    }

    #[test]
    fn garbage_is_screened_out() {
        assert!(!is_transcribable(&[7u8; 9000], 8000));
    }

    #[tokio::test]
    async fn floor_skips_network() {
        // Below the floor nothing is sent, so a fake key is fine
        let stt = SpeechToText::new_whisper(
            SecretString::from("sk-test"),
            "whisper-1".to_string(),
            8000,
        );
        let text = stt.transcribe(&[0u8; 100]).await.unwrap();
        assert!(text.is_empty());
    }
}
