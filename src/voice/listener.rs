//! Marker-line listener processes
//!
//! Wake-word and stop-phrase detection run as external programs. Each prints
//! a line containing its marker token when it hears its phrase; everything
//! else on stdout is ignored.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::process::{ExitKind, ProcessGroup, ProcessRegistry, StopSignal, in_group};
use crate::config::ListenerConfig;
use crate::{Error, Result};

/// Environment variable carrying the wake vocabulary as a JSON array
pub const WAKE_WORDS_ENV: &str = "WINTERFRESH_WAKE_WORDS";

/// How a listen ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// The marker was seen
    Triggered,
    /// The caller cancelled before a marker arrived
    Cancelled,
}

/// Waits for an external trigger
#[async_trait]
pub trait Listener: Send + Sync {
    /// Run until the marker is seen or `cancel` fires
    ///
    /// The listener process is always stopped before this returns.
    ///
    /// # Errors
    ///
    /// Returns `Error::WakeWord` if the process cannot start or exits on its
    /// own without printing the marker
    async fn listen(&self, cancel: &CancellationToken) -> Result<ListenOutcome>;
}

/// Runs a configured command and watches its stdout for a marker token
pub struct MarkerListener {
    name: &'static str,
    config: ListenerConfig,
    wake_words: Vec<String>,
    registry: ProcessRegistry,
}

impl MarkerListener {
    /// Create a listener
    #[must_use]
    pub const fn new(
        name: &'static str,
        config: ListenerConfig,
        wake_words: Vec<String>,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            name,
            config,
            wake_words,
            registry,
        }
    }
}

#[async_trait]
impl Listener for MarkerListener {
    async fn listen(&self, cancel: &CancellationToken) -> Result<ListenOutcome> {
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(Error::WakeWord(format!("{} listener has no command", self.name)));
        };

        let mut command = Command::new(program);
        in_group(&mut command, None)
            .args(args)
            .env(WAKE_WORDS_ENV, serde_json::to_string(&self.wake_words)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|e| Error::WakeWord(format!("failed to spawn {program}: {e}")))?;

        let group = ProcessGroup::new(self.name, child.id(), StopSignal::Terminate);
        self.registry.register(&group);

        let Some(stdout) = child.stdout.take() else {
            group.terminate();
            return Err(Error::WakeWord("listener stdout unavailable".to_string()));
        };
        let mut lines = BufReader::new(stdout).lines();

        tracing::debug!(listener = self.name, program = %program, "listening");

        let outcome = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(ListenOutcome::Cancelled),
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.contains(&self.config.marker) => {
                        tracing::info!(listener = self.name, "marker detected");
                        break Ok(ListenOutcome::Triggered);
                    }
                    Ok(Some(line)) => tracing::trace!(listener = self.name, line = %line, "listener output"),
                    Ok(None) => break Err(None),
                    Err(e) => break Err(Some(e)),
                },
            }
        };

        let stopping = outcome.is_ok();
        group.terminate();
        let _ = child.start_kill();
        let status = child.wait().await;
        group.mark_exited();

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(Some(e)) => Err(Error::WakeWord(format!("{} listener read failed: {e}", self.name))),
            Err(None) => {
                let kind = status.map(ExitKind::classify)?;
                // Exiting cleanly without a marker is still unexpected
                let reason = if kind.is_failure(stopping) {
                    format!("{} listener failed: {kind:?}", self.name)
                } else {
                    format!("{} listener exited without a marker", self.name)
                };
                Err(Error::WakeWord(reason))
            }
        }
    }
}
