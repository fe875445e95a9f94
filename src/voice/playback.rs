//! Audio playback to speakers
//!
//! Playback runs an external player (`aplay` on Linux, `play` from sox
//! elsewhere) in its own process group. Audio either comes from a file on
//! disk or is streamed to the player's stdin as it arrives.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use super::process::{ExitKind, ProcessGroup, ProcessRegistry, StopSignal, in_group};
use crate::config::PlaybackConfig;
use crate::{Error, Result};

/// What a player should play
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    /// Raw 16-bit mono PCM at the playback rate (cached speech)
    RawFile(PathBuf),
    /// A self-describing audio file (chimes)
    WavFile(PathBuf),
    /// Raw PCM written through [`Playback::write`]
    Stream,
}

/// A running playback
#[async_trait]
pub trait Playback: Send {
    /// Handle that force-stops this playback
    fn group(&self) -> ProcessGroup;

    /// Send the next chunk of a streamed source
    ///
    /// Returns `false` once the player is gone; further writes are no-ops.
    async fn write(&mut self, chunk: &[u8]) -> bool;

    /// Close the input and wait for the player to finish
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the player failed on its own
    async fn finish(&mut self) -> Result<()>;
}

/// Something that can start playbacks
pub trait Player: Send + Sync {
    /// Start playing `source`
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the player cannot be spawned
    fn start(&self, source: &PlaybackSource) -> Result<Box<dyn Playback>>;
}

/// Plays audio through an external player process
pub struct ProcessPlayer {
    config: PlaybackConfig,
    registry: ProcessRegistry,
}

impl ProcessPlayer {
    /// Create a player
    #[must_use]
    pub const fn new(config: PlaybackConfig, registry: ProcessRegistry) -> Self {
        Self { config, registry }
    }
}

impl Player for ProcessPlayer {
    fn start(&self, source: &PlaybackSource) -> Result<Box<dyn Playback>> {
        let (program, args) = player_command(&self.config, source);

        let mut command = Command::new(&program);
        in_group(&mut command, None)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .stdin(if matches!(source, PlaybackSource::Stream) {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if cfg!(not(target_os = "linux")) {
            if let Some(device) = &self.config.device {
                command.env("AUDIODEV", device);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Playback(format!("failed to spawn {program}: {e}")))?;

        // Force-kill: barge-in must not wait for buffered audio to drain
        let group = ProcessGroup::new("playback", child.id(), StopSignal::Kill);
        self.registry.register(&group);

        tracing::debug!(program = %program, pgid = ?group.pgid(), source = ?source, "playback started");

        Ok(Box::new(ProcessPlayback {
            stdin: child.stdin.take(),
            child,
            group,
            started_at: Instant::now(),
            first_write: None,
        }))
    }
}

/// Player program and arguments for this platform
#[must_use]
pub fn player_command(config: &PlaybackConfig, source: &PlaybackSource) -> (String, Vec<String>) {
    let rate = config.sample_rate.to_string();
    let raw = !matches!(source, PlaybackSource::WavFile(_));
    let input = match source {
        PlaybackSource::RawFile(path) | PlaybackSource::WavFile(path) => path_arg(path),
        PlaybackSource::Stream => "-".to_string(),
    };

    let mut args = vec!["-q".to_string()];

    if cfg!(target_os = "linux") {
        if let Some(device) = &config.device {
            args.extend(["-D".to_string(), device.clone()]);
        }
        if raw {
            args.extend(
                ["-t", "raw", "-f", "S16_LE", "-r", &rate, "-c", "1"]
                    .into_iter()
                    .map(String::from),
            );
        }
        args.push(input);
        ("aplay".to_string(), args)
    } else {
        if raw {
            args.extend(
                ["-t", "raw", "-b", "16", "-e", "signed-integer", "-r", &rate, "-c", "1"]
                    .into_iter()
                    .map(String::from),
            );
        }
        args.push(input);
        ("play".to_string(), args)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

struct ProcessPlayback {
    child: Child,
    stdin: Option<ChildStdin>,
    group: ProcessGroup,
    started_at: Instant,
    first_write: Option<Instant>,
}

#[async_trait]
impl Playback for ProcessPlayback {
    fn group(&self) -> ProcessGroup {
        self.group.clone()
    }

    async fn write(&mut self, chunk: &[u8]) -> bool {
        if self.group.is_terminated() {
            self.stdin = None;
            return false;
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };

        let written = tokio::select! {
            () = self.group.terminated() => false,
            result = stdin.write_all(chunk) => result.is_ok(),
        };

        if !written {
            // Player exited or was killed
            self.stdin = None;
            return false;
        }

        if self.first_write.is_none() {
            let now = Instant::now();
            self.first_write = Some(now);
            tracing::debug!(
                first_write_ms = now.duration_since(self.started_at).as_millis(),
                "first audio written to player"
            );
        }
        true
    }

    async fn finish(&mut self) -> Result<()> {
        // EOF lets the player drain and exit
        self.stdin = None;

        let exit = tokio::select! {
            status = self.child.wait() => Some(status),
            () = self.group.terminated() => None,
        };

        let result = match exit {
            Some(Ok(status)) => {
                let kind = ExitKind::classify(status);
                if kind.is_failure(self.group.is_terminated()) {
                    Err(Error::Playback(format!("player exited abnormally: {kind:?}")))
                } else {
                    Ok(())
                }
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                Ok(())
            }
        };

        self.group.mark_exited();
        tracing::debug!(
            elapsed_ms = self.started_at.elapsed().as_millis(),
            stopped = self.group.is_terminated(),
            "playback finished"
        );
        result
    }
}

impl Drop for ProcessPlayback {
    fn drop(&mut self) {
        if !self.group.has_exited() {
            self.group.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn streamed_pcm_uses_raw_aplay() {
        let config = PlaybackConfig {
            device: Some("plughw:2,0".to_string()),
            sample_rate: 24_000,
        };
        let (program, args) = player_command(&config, &PlaybackSource::Stream);
        assert_eq!(program, "aplay");
        assert_eq!(
            args.join(" "),
            "-q -D plughw:2,0 -t raw -f S16_LE -r 24000 -c 1 -"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn wav_files_skip_raw_flags() {
        let config = PlaybackConfig::default();
        let source = PlaybackSource::WavFile(PathBuf::from("/tmp/chime.wav"));
        let (_, args) = player_command(&config, &source);
        assert_eq!(args, vec!["-q", "/tmp/chime.wav"]);
    }

    #[test]
    fn cached_files_play_as_raw() {
        let config = PlaybackConfig::default();
        let source = PlaybackSource::RawFile(PathBuf::from("/tmp/abc.pcm"));
        let (_, args) = player_command(&config, &source);
        assert!(args.iter().any(|a| a == "raw"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/abc.pcm"));
    }
}
