//! System output volume

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::MixerConfig;
use crate::{Error, Result};

/// Sets the output volume
#[async_trait]
pub trait Mixer: Send + Sync {
    /// Set the volume to `percent` of full scale
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the mixer rejects the change
    async fn set_volume(&self, percent: u8) -> Result<()>;
}

/// ALSA mixer driven through `amixer`
pub struct AlsaMixer {
    config: MixerConfig,
}

impl AlsaMixer {
    #[must_use]
    pub const fn new(config: MixerConfig) -> Self {
        Self { config }
    }

    /// Arguments for `amixer`
    #[must_use]
    pub fn args(&self, percent: u8) -> Vec<String> {
        vec![
            "-c".to_string(),
            self.config.card.clone(),
            "sset".to_string(),
            self.config.control.clone(),
            format!("{}%", percent.min(100)),
        ]
    }
}

#[async_trait]
impl Mixer for AlsaMixer {
    async fn set_volume(&self, percent: u8) -> Result<()> {
        if cfg!(not(target_os = "linux")) {
            tracing::warn!(percent, "volume control is only supported on Linux");
            return Ok(());
        }

        let status = Command::new("amixer")
            .args(self.args(percent))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Audio(format!("failed to run amixer: {e}")))?;

        if !status.success() {
            return Err(Error::Audio(format!("amixer exited with {status}")));
        }

        tracing::info!(percent, card = %self.config.card, "volume set");
        Ok(())
    }
}
