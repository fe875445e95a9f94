//! Startup checks
//!
//! Verifies that credentials for the selected providers are present and the
//! audio tooling is installed before the main loop starts.

use crate::config::{ChatBackend, Config, SttBackend, TtsBackend};
use crate::{Error, Result};

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    /// Failing a required check blocks startup
    pub required: bool,
    pub detail: String,
}

/// All checks for a configuration
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub checks: Vec<Check>,
}

impl Report {
    /// Whether every required check passed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.ok || !c.required)
    }

    /// Turn a failed report into an error naming what is missing
    ///
    /// # Errors
    ///
    /// Returns `Error::Preflight` if a required check failed
    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            return Ok(self);
        }
        let missing: Vec<&str> = self
            .checks
            .iter()
            .filter(|c| c.required && !c.ok)
            .map(|c| c.name.as_str())
            .collect();
        Err(Error::Preflight(format!("missing: {}", missing.join(", "))))
    }

    fn push(&mut self, name: impl Into<String>, ok: bool, required: bool, detail: impl Into<String>) {
        self.checks.push(Check {
            name: name.into(),
            ok,
            required,
            detail: detail.into(),
        });
    }
}

/// Binaries the capture and playback pipelines shell out to
#[must_use]
pub fn required_tools() -> &'static [&'static str] {
    if cfg!(target_os = "linux") {
        &["arecord", "aplay", "sox"]
    } else {
        &["sox", "play"]
    }
}

/// Run every check
#[must_use]
pub fn run(config: &Config) -> Report {
    let mut report = Report::default();
    let keys = &config.api_keys;

    let stt_key = match config.providers.stt {
        SttBackend::Whisper => ("OPENAI_API_KEY", keys.openai.is_some()),
        SttBackend::Deepgram => ("DEEPGRAM_API_KEY", keys.deepgram.is_some()),
    };
    let chat_key = match config.providers.chat {
        ChatBackend::OpenAi => ("OPENAI_API_KEY", keys.openai.is_some()),
        ChatBackend::OpenRouter => ("OPENROUTER_API_KEY", keys.openrouter.is_some()),
        ChatBackend::Anthropic => ("ANTHROPIC_API_KEY", keys.anthropic.is_some()),
    };
    let tts_key = match config.providers.tts {
        TtsBackend::OpenAi => ("OPENAI_API_KEY", keys.openai.is_some()),
        TtsBackend::ElevenLabs => ("ELEVENLABS_API_KEY", keys.elevenlabs.is_some()),
    };

    let mut seen = Vec::new();
    for (name, present) in [stt_key, chat_key, tts_key] {
        if seen.contains(&name) {
            continue;
        }
        seen.push(name);
        let detail = if present { "set" } else { "not set" };
        report.push(name, present, true, detail);
    }

    for tool in required_tools() {
        check_binary(&mut report, tool, true);
    }

    if let Some(program) = config.wake.command.first() {
        check_binary(&mut report, program, true);
    }
    if let Some(program) = config.stop_listener.as_ref().and_then(|s| s.command.first()) {
        check_binary(&mut report, program, false);
    }
    if cfg!(target_os = "linux") {
        check_binary(&mut report, "amixer", false);
    }

    for chime in [&config.mixer.chime, &config.mixer.processing_chime]
        .into_iter()
        .flatten()
    {
        report.push(
            format!("chime {}", chime.display()),
            chime.is_file(),
            false,
            if chime.is_file() { "found" } else { "missing" },
        );
    }

    for check in &report.checks {
        if check.ok {
            tracing::debug!(check = %check.name, detail = %check.detail, "preflight ok");
        } else if check.required {
            tracing::error!(check = %check.name, detail = %check.detail, "preflight failed");
        } else {
            tracing::warn!(check = %check.name, detail = %check.detail, "optional check failed");
        }
    }

    report
}

fn check_binary(report: &mut Report, program: &str, required: bool) {
    match which::which(program) {
        Ok(path) => report.push(program, true, required, path.display().to_string()),
        Err(_) => report.push(program, false, required, "not found in PATH"),
    }
}
