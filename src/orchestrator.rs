//! Session orchestrator
//!
//! Drives one awake session: greet, then loop over recording attempts,
//! handing each finished recording to a spawned turn pipeline
//! (transcribe, reply, speak) until the session goes back to sleep.
//!
//! Recording and playback overlap on purpose. Once a pipeline reports that
//! it is speaking, the next recording starts so the user can barge in. Each
//! attempt bumps the session's turn generation; a pipeline that finds its
//! generation superseded drops its remaining side effects.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::chat::Chatter;
use crate::config::Config;
use crate::intent::{contains_sentinel, is_stop_intent, parse_volume};
use crate::mixer::Mixer;
use crate::session::{Deadline, HistoryExpiry, Operations, Session, Turn};
use crate::speech::SpeechController;
use crate::voice::capture::{CompletionKind, Recorder, RecordingAttempt};
use crate::voice::listener::{ListenOutcome, Listener};
use crate::voice::process::ProcessGroup;
use crate::voice::stt::Transcriber;
use crate::voice::vad::{VadEvent, VoiceActivityDetector};
use crate::{Error, Result};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Nobody spoke for the idle window, or capture failed
    IdleTimeout,
    /// The user asked to stop
    StopIntent,
    /// The process is shutting down
    Shutdown,
}

/// External capabilities the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub recorder: Arc<dyn Recorder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub chatter: Arc<dyn Chatter>,
    pub speech: Arc<SpeechController>,
    pub mixer: Arc<dyn Mixer>,
    pub stop_listener: Option<Arc<dyn Listener>>,
}

/// Progress reports from a turn pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnEvent {
    /// The reply is about to play; recording may resume
    Speaking,
    /// The turn ended without a reply to play
    Finished,
    /// A newer attempt superseded the turn
    Abandoned,
    /// The user asked to stop
    Stop,
}

struct Shared {
    config: Arc<Config>,
    services: Collaborators,
    session: Arc<Session>,
    ops: Arc<Operations>,
    expiry: HistoryExpiry,
}

/// Runs awake sessions against a [`Session`]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Create an orchestrator
    ///
    /// `ops` must be the same flags the speech controller updates.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        services: Collaborators,
        session: Arc<Session>,
        ops: Arc<Operations>,
    ) -> Self {
        let expiry = HistoryExpiry::new(config.session.history_expiry);
        Self {
            shared: Arc::new(Shared {
                config,
                services,
                session,
                ops,
                expiry,
            }),
        }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.shared.session
    }

    #[must_use]
    pub fn operations(&self) -> &Arc<Operations> {
        &self.shared.ops
    }

    #[must_use]
    pub fn history_expiry(&self) -> &HistoryExpiry {
        &self.shared.expiry
    }

    /// Run one awake session, from greeting to sleep
    ///
    /// Turn failures are recovered inside the session. A capture failure
    /// ends the session like an idle timeout (sleep phrase included) and is
    /// then returned so the supervisor can count it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Capture` if the capture pipeline fails
    pub async fn run_session(&self, shutdown: &CancellationToken) -> Result<SessionEnd> {
        let shared = &self.shared;
        shared.session.set_active(true);
        tracing::info!(history = shared.session.len(), "session started");

        // Warm-up is best-effort and never awaited
        let chatter = Arc::clone(&shared.services.chatter);
        tokio::spawn(async move {
            if let Err(e) = chatter.warm_up().await {
                tracing::debug!(error = %e, "reply provider warm-up failed");
            }
        });

        let stop_heard = CancellationToken::new();
        let listener_cancel = CancellationToken::new();
        let _listener_guard = listener_cancel.clone().drop_guard();
        if let Some(listener) = shared.services.stop_listener.clone() {
            let heard = stop_heard.clone();
            tokio::spawn(async move {
                match listener.listen(&listener_cancel).await {
                    Ok(ListenOutcome::Triggered) => heard.cancel(),
                    Ok(ListenOutcome::Cancelled) => {}
                    Err(e) => tracing::warn!(error = %e, "stop listener failed"),
                }
            });
        }

        match self.converse(shutdown, &stop_heard).await {
            Ok(end) => {
                self.go_to_sleep(end).await;
                Ok(end)
            }
            Err(e) => {
                self.go_to_sleep(SessionEnd::IdleTimeout).await;
                Err(e)
            }
        }
    }

    async fn converse(
        &self,
        shutdown: &CancellationToken,
        stop_heard: &CancellationToken,
    ) -> Result<SessionEnd> {
        let shared = &self.shared;
        let phrases = &shared.config.phrases;

        let greeting = if shared
            .session
            .has_recent_history(shared.config.session.history_expiry)
        {
            &phrases.welcome_back
        } else {
            &phrases.greeting
        };
        tokio::select! {
            () = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
            () = stop_heard.cancelled() => return Ok(SessionEnd::StopIntent),
            () = self.say(greeting) => {}
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        loop {
            let (generation, attempt) = self.record(shutdown, stop_heard).await?;

            if !attempt.kind.has_turn() {
                return Ok(match attempt.kind {
                    CompletionKind::TimedOut => SessionEnd::IdleTimeout,
                    _ if shutdown.is_cancelled() => SessionEnd::Shutdown,
                    _ => SessionEnd::StopIntent,
                });
            }

            if attempt.audio.is_empty() {
                tracing::debug!("recording ended without audio");
                tokio::time::sleep(shared.config.session.error_backoff).await;
                continue;
            }

            tracing::debug!(
                generation,
                bytes = attempt.audio.len(),
                elapsed_ms = attempt.started_at.elapsed().as_millis(),
                kind = ?attempt.kind,
                "recording complete"
            );
            tokio::spawn(run_turn(
                Arc::clone(shared),
                generation,
                attempt.audio,
                events_tx.clone(),
            ));

            let deadline = Instant::now() + shared.config.session.turn_timeout;
            let event = loop {
                tokio::select! {
                    () = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                    () = stop_heard.cancelled() => return Ok(SessionEnd::StopIntent),
                    () = tokio::time::sleep_until(deadline) => break None,
                    event = events_rx.recv() => match event {
                        Some((g, event)) if g == generation => break Some(event),
                        Some(_) => {}
                        None => break None,
                    },
                }
            };

            match event {
                Some(TurnEvent::Stop) => return Ok(SessionEnd::StopIntent),
                Some(TurnEvent::Speaking | TurnEvent::Finished | TurnEvent::Abandoned) => {}
                None => {
                    tracing::warn!(generation, "turn timed out, moving on");
                    self.supersede();
                }
            }
        }
    }

    /// Invalidate the in-flight pipeline and silence anything it started
    fn supersede(&self) {
        self.shared.session.begin_attempt();
        self.shared.services.speech.cancel();
    }

    /// Speak a fixed phrase, logging failures
    async fn say(&self, text: &str) {
        if let Err(e) = self.shared.services.speech.speak(text).await {
            tracing::warn!(error = %e, "failed to speak");
        }
    }

    /// Run one recording attempt while watching for voice and timers
    async fn record(
        &self,
        shutdown: &CancellationToken,
        stop_heard: &CancellationToken,
    ) -> Result<(u64, RecordingAttempt)> {
        let shared = &self.shared;
        let started_at = std::time::Instant::now();
        let generation = shared.session.begin_attempt();
        shared.ops.set_active_asking(false);

        let mut stream = shared
            .services
            .recorder
            .start()
            .inspect_err(|e| tracing::warn!(error = %e, "capture failed to start"))?;

        let capture = &shared.config.capture;
        let mut vad = VoiceActivityDetector::new(capture.vad_threshold, capture.vad_min_bytes);
        let mut idle = Deadline::new(shared.config.session.idle_timeout);
        idle.arm();
        let hard_stop = Instant::now() + capture.max_duration;

        let mut ticker = tokio::time::interval(shared.config.session.monitor_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut forced: Option<CompletionKind> = None;
        let mut monitor_open = true;

        let completion = loop {
            tokio::select! {
                result = &mut stream.completion => break result,
                () = shutdown.cancelled(), if forced.is_none() => {
                    forced = Some(CompletionKind::Aborted);
                    stream.stop();
                }
                () = stop_heard.cancelled(), if forced.is_none() => {
                    forced = Some(CompletionKind::Aborted);
                    stream.stop();
                }
                chunk = stream.monitor.recv(), if monitor_open => match chunk {
                    Some(chunk) => {
                        if let Some(VadEvent::VoiceDetected { rms }) = vad.process(&chunk) {
                            self.on_voice(rms);
                            idle.arm();
                        }
                    }
                    None => monitor_open = false,
                },
                _ = ticker.tick() => {
                    if shared.ops.any() {
                        idle.arm();
                    }
                    if forced.is_none() {
                        if idle.expired() {
                            tracing::info!("idle timeout, no voice detected");
                            forced = Some(CompletionKind::TimedOut);
                            stream.stop();
                        } else if Instant::now() >= hard_stop {
                            tracing::info!("recording hit maximum length");
                            forced = Some(CompletionKind::Truncated);
                            stream.stop();
                        }
                    }
                }
            }
        };

        shared.ops.set_active_asking(false);

        let audio = match completion {
            Ok(Ok(audio)) => audio,
            // Failures after a deliberate stop carry no information
            Ok(Err(_)) | Err(_) if forced.is_some() => Vec::new(),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Capture("capture ended without a result".to_string())),
        };

        Ok((
            generation,
            RecordingAttempt {
                started_at,
                audio,
                kind: forced.unwrap_or(CompletionKind::CompletedOnSilence),
            },
        ))
    }

    fn on_voice(&self, rms: f32) {
        let shared = &self.shared;
        if !shared.ops.is_active_asking() {
            tracing::debug!(rms, "voice detected");
        }
        shared.ops.set_active_asking(true);
        shared.expiry.disarm();

        if shared.services.speech.cancel() {
            tracing::info!(rms, "barge-in, playback stopped");
        }
    }

    async fn go_to_sleep(&self, end: SessionEnd) {
        let shared = &self.shared;

        // Anything still in flight is stale now
        self.supersede();

        if end != SessionEnd::Shutdown {
            let bound = shared.config.session.turn_timeout;
            if tokio::time::timeout(bound, self.say(&shared.config.phrases.sleep))
                .await
                .is_err()
            {
                shared.services.speech.cancel();
                tracing::warn!("sleep acknowledgement took too long");
            }
        }

        shared.ops.clear();
        shared.session.set_active(false);
        shared.expiry.arm_remaining(&shared.session);
        tracing::info!(reason = ?end, "session asleep");
    }
}

/// Stops the processing indicator when a turn ends by any path
struct TurnGuard {
    ops: Arc<Operations>,
    chime: Option<ProcessGroup>,
}

impl TurnGuard {
    fn stop_chime(&mut self) {
        if let Some(chime) = self.chime.take() {
            chime.terminate();
        }
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.stop_chime();
        self.ops.set_processing(false);
    }
}

async fn run_turn(
    shared: Arc<Shared>,
    generation: u64,
    audio: Vec<u8>,
    events: mpsc::UnboundedSender<(u64, TurnEvent)>,
) {
    shared.ops.set_processing(true);
    let chime = shared
        .config
        .mixer
        .processing_chime
        .as_deref()
        .and_then(|path| {
            shared
                .services
                .speech
                .start_chime(path)
                .inspect_err(|e| tracing::debug!(error = %e, "processing chime failed"))
                .ok()
        });
    let mut guard = TurnGuard {
        ops: Arc::clone(&shared.ops),
        chime,
    };

    let event = match process_turn(&shared, generation, &audio, &events, &mut guard).await {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(generation, error = %e, "turn abandoned after error");
            TurnEvent::Finished
        }
    };

    drop(guard);
    let _ = events.send((generation, event));
}

async fn process_turn(
    shared: &Shared,
    generation: u64,
    audio: &[u8],
    events: &mpsc::UnboundedSender<(u64, TurnEvent)>,
    guard: &mut TurnGuard,
) -> Result<TurnEvent> {
    let session = &shared.session;
    let phrases = &shared.config.phrases;

    let text = shared.services.transcriber.transcribe(audio).await?;
    if !session.is_current(generation) {
        return Ok(TurnEvent::Abandoned);
    }
    if text.trim().is_empty() {
        tracing::debug!(generation, "empty transcript, listening again");
        return Ok(TurnEvent::Finished);
    }

    if is_stop_intent(&text, &phrases.stop_phrases) {
        tracing::info!(transcript = %text, "stop intent");
        return Ok(TurnEvent::Stop);
    }

    if let Some(level) = parse_volume(&text, &phrases.wake_words) {
        guard.stop_chime();
        shared.services.mixer.set_volume(level * 10).await?;
        if let Some(chime) = &shared.config.mixer.chime {
            shared.services.speech.play_chime(chime).await?;
        }
        return Ok(TurnEvent::Finished);
    }

    if !session.push_if_current(generation, Turn::user(text)) {
        return Ok(TurnEvent::Abandoned);
    }

    let reply = shared.services.chatter.reply(&session.history()).await?;
    if !session.is_current(generation) {
        return Ok(TurnEvent::Abandoned);
    }

    if contains_sentinel(&reply, &phrases.shutdown_sentinel) {
        tracing::info!("reply asked to end the conversation");
        return Ok(TurnEvent::Stop);
    }
    if reply.is_empty() {
        return Ok(TurnEvent::Finished);
    }

    if !session.push_if_current(generation, Turn::assistant(reply.clone())) {
        return Ok(TurnEvent::Abandoned);
    }
    session.touch();
    shared.expiry.arm(session);

    guard.stop_chime();

    // Speaking is reported from inside the slot lock, once the utterance is
    // installed; the next attempt's barge-in can then cancel it
    shared
        .services
        .speech
        .speak_if(&reply, || {
            session.is_current(generation) && events.send((generation, TurnEvent::Speaking)).is_ok()
        })
        .await?;

    Ok(TurnEvent::Finished)
}
