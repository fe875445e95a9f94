//! Lifecycle and recovery supervisor
//!
//! Runs wake → session cycles forever. Errors escaping a cycle are counted;
//! any successful wake or session resets the count. Reaching the threshold,
//! or a session ending on idle timeout, triggers a full restart: every child
//! process is stopped, a grace period passes, and the runtime is rebuilt from
//! scratch with a fresh session.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::orchestrator::{Orchestrator, SessionEnd};
use crate::voice::listener::{ListenOutcome, Listener};
use crate::voice::process::ProcessRegistry;
use crate::Result;

/// Everything one incarnation of the assistant needs
pub struct Runtime {
    pub wake: Arc<dyn Listener>,
    pub orchestrator: Orchestrator,
    pub registry: ProcessRegistry,
}

/// Builds a fresh [`Runtime`]
pub type Startup = Box<dyn Fn() -> Result<Runtime> + Send + Sync>;

/// What the outer loop does after a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Listen,
    Restart,
    Stop,
}

/// Owns the outer loop and the consecutive-error counter
pub struct Supervisor {
    startup: Startup,
    threshold: u32,
    grace: Duration,
    backoff: Duration,
    consecutive_errors: u32,
    restarts: u64,
}

impl Supervisor {
    #[must_use]
    pub fn new(startup: Startup, config: &SessionConfig) -> Self {
        Self {
            startup,
            threshold: config.restart_threshold.max(1),
            grace: config.restart_grace,
            backoff: config.error_backoff,
            consecutive_errors: 0,
            restarts: 0,
        }
    }

    /// Failures since the last successful wake or session
    #[must_use]
    pub const fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Full restarts performed so far
    #[must_use]
    pub const fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Run until `shutdown` fires
    ///
    /// Child processes are cleaned up on the way out.
    ///
    /// # Errors
    ///
    /// Returns error only if the very first startup fails
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let mut runtime = (self.startup)()?;
        tracing::info!("supervisor started");

        while !shutdown.is_cancelled() {
            let next = match self.cycle(&runtime, shutdown).await {
                Ok(next) => next,
                Err(e) => {
                    self.consecutive_errors += 1;
                    tracing::error!(
                        error = %e,
                        consecutive = self.consecutive_errors,
                        threshold = self.threshold,
                        "session cycle failed"
                    );

                    if self.consecutive_errors >= self.threshold {
                        Next::Restart
                    } else {
                        tokio::select! {
                            () = shutdown.cancelled() => Next::Stop,
                            () = tokio::time::sleep(self.backoff) => Next::Listen,
                        }
                    }
                }
            };

            match next {
                Next::Listen => {}
                Next::Stop => break,
                Next::Restart => {
                    let Some(fresh) = self.restart(&runtime, shutdown).await else {
                        break;
                    };
                    runtime = fresh;
                }
            }
        }

        let stopped = runtime.registry.terminate_all();
        tracing::info!(stopped, "supervisor stopped");
        Ok(())
    }

    /// Wait for the wake signal, then run one session
    async fn cycle(&mut self, runtime: &Runtime, shutdown: &CancellationToken) -> Result<Next> {
        tracing::info!("waiting for wake word");
        if runtime.wake.listen(shutdown).await? == ListenOutcome::Cancelled {
            return Ok(Next::Stop);
        }
        self.consecutive_errors = 0;

        let end = runtime.orchestrator.run_session(shutdown).await?;
        self.consecutive_errors = 0;

        Ok(match end {
            SessionEnd::IdleTimeout => Next::Restart,
            SessionEnd::StopIntent => Next::Listen,
            SessionEnd::Shutdown => Next::Stop,
        })
    }

    /// Stop every child, pause, and build a fresh runtime
    ///
    /// Keeps retrying the startup until it succeeds; `None` means shutdown
    /// was requested first.
    async fn restart(&mut self, old: &Runtime, shutdown: &CancellationToken) -> Option<Runtime> {
        loop {
            let stopped = old.registry.terminate_all();
            tracing::warn!(
                stopped,
                consecutive = self.consecutive_errors,
                "restarting"
            );

            tokio::select! {
                () = shutdown.cancelled() => return None,
                () = tokio::time::sleep(self.grace) => {}
            }

            match (self.startup)() {
                Ok(runtime) => {
                    self.consecutive_errors = 0;
                    self.restarts += 1;
                    tracing::info!(restarts = self.restarts, "restart complete");
                    return Some(runtime);
                }
                Err(e) => {
                    tracing::error!(error = %e, "startup failed during restart");
                }
            }
        }
    }
}
