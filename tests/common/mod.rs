//! Shared test utilities
//!
//! Scripted stand-ins for the microphone, providers, speaker, and listeners
//! so sessions can run without audio hardware or network access.

#![allow(
    dead_code,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use winterfresh::chat::Chatter;
use winterfresh::config::Config;
use winterfresh::mixer::Mixer;
use winterfresh::orchestrator::{Collaborators, Orchestrator};
use winterfresh::session::{Operations, Session, Turn};
use winterfresh::speech::{SpeechController, TtsCache};
use winterfresh::voice::capture::{CaptureStream, Recorder};
use winterfresh::voice::listener::{ListenOutcome, Listener};
use winterfresh::voice::playback::{Playback, PlaybackSource, Player};
use winterfresh::voice::process::ProcessGroup;
use winterfresh::voice::stt::Transcriber;
use winterfresh::voice::tts::{AudioStream, Synthesizer};
use winterfresh::voice::wav::pcm_to_wav;
use winterfresh::{Error, Result};

pub const SAMPLE_RATE: u32 = 16_000;

/// Generate a 16-bit PCM sine tone
pub fn sine_pcm(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<u8> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .flat_map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let value = amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin();
            ((value * f32::from(i16::MAX)) as i16).to_le_bytes()
        })
        .collect()
}

/// Generate 16-bit PCM silence
pub fn silence_pcm(duration_secs: f32) -> Vec<u8> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0; num_samples * 2]
}

/// A short spoken utterance, WAV encoded
pub fn utterance_wav() -> Vec<u8> {
    pcm_to_wav(&sine_pcm(220.0, 0.5, 0.4), SAMPLE_RATE).expect("failed to encode wav")
}

/// Config tuned for fast, paused-clock tests
pub fn test_config(cache_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.cache_dir = cache_dir.to_path_buf();
    config.session.idle_timeout = Duration::from_secs(2);
    config.session.turn_timeout = Duration::from_secs(10);
    config.session.restart_grace = Duration::from_millis(200);
    config.session.error_backoff = Duration::from_millis(100);
    config.capture.vad_threshold = 0.05;
    config.capture.vad_min_bytes = 0;
    config.mixer.chime = None;
    config.mixer.processing_chime = None;
    config
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// One scripted recording attempt
#[derive(Clone)]
pub struct Take {
    /// Wait before anything is emitted
    pub delay: Duration,
    /// Monitoring chunks, sent in order
    pub chunks: Vec<Vec<u8>>,
    /// Completion audio; `None` waits until the pipeline is stopped
    pub audio: Option<Vec<u8>>,
}

impl Take {
    /// Completes right away with `audio`
    pub fn audio(audio: Vec<u8>) -> Self {
        Self {
            delay: Duration::ZERO,
            chunks: Vec::new(),
            audio: Some(audio),
        }
    }

    /// Emits `chunks` after `delay`, then completes with `audio`
    pub fn voice_then(delay: Duration, chunks: Vec<Vec<u8>>, audio: Vec<u8>) -> Self {
        Self {
            delay,
            chunks,
            audio: Some(audio),
        }
    }

    /// Never completes on its own
    pub fn silent() -> Self {
        Self {
            delay: Duration::ZERO,
            chunks: Vec::new(),
            audio: None,
        }
    }
}

/// Plays back scripted takes; once the script runs out every take is silent
#[derive(Default)]
pub struct FakeRecorder {
    takes: Mutex<VecDeque<Take>>,
    fail_start: bool,
    started: AtomicUsize,
}

impl FakeRecorder {
    pub fn new(takes: impl IntoIterator<Item = Take>) -> Self {
        Self {
            takes: Mutex::new(takes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// A recorder whose pipeline never starts
    pub fn broken() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl Recorder for FakeRecorder {
    fn start(&self) -> Result<CaptureStream> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(Error::Capture("no capture device".to_string()));
        }

        let take = self
            .takes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(Take::silent);

        let (monitor_tx, monitor) = mpsc::channel(64);
        let (done_tx, completion) = oneshot::channel();
        let group = ProcessGroup::detached("fake-recorder");
        let stopped = group.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = stopped.terminated() => {
                    let _ = done_tx.send(Ok(Vec::new()));
                    return;
                }
                () = tokio::time::sleep(take.delay) => {}
            }
            for chunk in take.chunks {
                let _ = monitor_tx.send(chunk).await;
            }
            // Let the orchestrator drain the monitor before completion lands
            tokio::time::sleep(Duration::from_millis(50)).await;

            let audio = match take.audio {
                Some(audio) => audio,
                None => {
                    stopped.terminated().await;
                    Vec::new()
                }
            };
            let _ = done_tx.send(Ok(audio));
            drop(monitor_tx);
        });

        Ok(CaptureStream {
            monitor,
            completion,
            group,
        })
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Returns scripted transcripts, then empty text
#[derive(Default)]
pub struct FakeTranscriber {
    transcripts: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(transcripts: &[&str]) -> Self {
        Self {
            transcripts: Mutex::new(transcripts.iter().map(ToString::to_string).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.transcripts.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Returns scripted replies and remembers what it was asked
#[derive(Default)]
pub struct FakeChatter {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Turn>>>,
    delay: Duration,
}

impl FakeChatter {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(ToString::to_string).collect()),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Answer every request only after `delay`
    pub fn slow(replies: &[&str], delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(replies)
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Vec<Turn>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Chatter for FakeChatter {
    async fn reply(&self, history: &[Turn]) -> Result<String> {
        self.requests.lock().unwrap().push(history.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.replies.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Synthesizes text as its own bytes, split into two chunks
#[derive(Default)]
pub struct FakeSynth {
    requests: Mutex<Vec<String>>,
}

impl FakeSynth {
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    fn voice(&self) -> &str {
        "test-voice"
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.requests.lock().unwrap().push(text.to_string());
        let bytes = text.as_bytes().to_vec();
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        let chunks = vec![Ok(head.to_vec()), Ok(tail.to_vec())];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[derive(Default)]
pub struct FakeMixer {
    levels: Mutex<Vec<u8>>,
}

impl FakeMixer {
    pub fn levels(&self) -> Vec<u8> {
        self.levels.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mixer for FakeMixer {
    async fn set_volume(&self, percent: u8) -> Result<()> {
        self.levels.lock().unwrap().push(percent);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// One playback the fake player was asked for
#[derive(Debug, Clone)]
pub struct Played {
    pub source: PlaybackSource,
    pub bytes: Vec<u8>,
    pub group: ProcessGroup,
}

/// Records everything it plays; finishes instantly unless told to hold
#[derive(Default, Clone)]
pub struct FakePlayer {
    log: Arc<Mutex<Vec<Played>>>,
    hold: Option<Vec<u8>>,
}

impl FakePlayer {
    /// A player that keeps playing `text` until stopped
    pub fn holding(text: &str) -> Self {
        Self {
            log: Arc::default(),
            hold: Some(text.as_bytes().to_vec()),
        }
    }

    pub fn played(&self) -> Vec<Played> {
        self.log.lock().unwrap().clone()
    }

    /// Text of every streamed or cached utterance, in order
    pub fn spoken(&self) -> Vec<String> {
        self.played()
            .into_iter()
            .filter(|p| !matches!(p.source, PlaybackSource::WavFile(_)))
            .map(|p| String::from_utf8_lossy(&p.bytes).into_owned())
            .collect()
    }
}

impl Player for FakePlayer {
    fn start(&self, source: &PlaybackSource) -> Result<Box<dyn Playback>> {
        let bytes = match source {
            PlaybackSource::RawFile(path) => std::fs::read(path)?,
            PlaybackSource::WavFile(_) | PlaybackSource::Stream => Vec::new(),
        };
        let group = ProcessGroup::detached("fake-player");

        let mut log = self.log.lock().unwrap();
        log.push(Played {
            source: source.clone(),
            bytes,
            group: group.clone(),
        });

        Ok(Box::new(FakePlayback {
            log: Arc::clone(&self.log),
            index: log.len() - 1,
            hold: self.hold.clone(),
            group,
        }))
    }
}

struct FakePlayback {
    log: Arc<Mutex<Vec<Played>>>,
    index: usize,
    hold: Option<Vec<u8>>,
    group: ProcessGroup,
}

#[async_trait]
impl Playback for FakePlayback {
    fn group(&self) -> ProcessGroup {
        self.group.clone()
    }

    async fn write(&mut self, chunk: &[u8]) -> bool {
        if self.group.is_terminated() {
            return false;
        }
        self.log.lock().unwrap()[self.index]
            .bytes
            .extend_from_slice(chunk);
        true
    }

    async fn finish(&mut self) -> Result<()> {
        let held = {
            let log = self.log.lock().unwrap();
            self.hold.as_ref() == Some(&log[self.index].bytes)
        };
        if held {
            self.group.terminated().await;
        }
        self.group.mark_exited();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Triggers a fixed number of times, then cancels `shutdown`
pub struct FakeListener {
    triggers: AtomicUsize,
    shutdown: Option<CancellationToken>,
    fail: bool,
    calls: AtomicUsize,
}

impl FakeListener {
    /// Triggers `times` times, then waits for cancellation
    pub fn triggering(times: usize) -> Self {
        Self {
            triggers: AtomicUsize::new(times),
            shutdown: None,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Exits without ever printing its marker
    pub fn failing() -> Self {
        Self {
            triggers: AtomicUsize::new(0),
            shutdown: None,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Triggers `times` times, then shuts the process down
    pub fn then_shutdown(times: usize, shutdown: CancellationToken) -> Self {
        Self {
            triggers: AtomicUsize::new(times),
            shutdown: Some(shutdown),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Listener for FakeListener {
    async fn listen(&self, cancel: &CancellationToken) -> Result<ListenOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::WakeWord("wake listener exited before detecting".to_string()));
        }
        let left = self.triggers.load(Ordering::SeqCst);
        if left > 0 {
            self.triggers.store(left - 1, Ordering::SeqCst);
            return Ok(ListenOutcome::Triggered);
        }
        if let Some(shutdown) = &self.shutdown {
            shutdown.cancel();
        }
        cancel.cancelled().await;
        Ok(ListenOutcome::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Fakes behind one orchestrator, kept around for assertions
pub struct Rig {
    pub config: Arc<Config>,
    pub recorder: Arc<FakeRecorder>,
    pub transcriber: Arc<FakeTranscriber>,
    pub chatter: Arc<FakeChatter>,
    pub synth: Arc<FakeSynth>,
    pub player: FakePlayer,
    pub mixer: Arc<FakeMixer>,
    pub speech: Arc<SpeechController>,
    pub session: Arc<Session>,
    pub ops: Arc<Operations>,
}

impl Rig {
    pub fn new(
        config: Config,
        recorder: FakeRecorder,
        transcriber: FakeTranscriber,
        chatter: FakeChatter,
        player: FakePlayer,
    ) -> Self {
        let config = Arc::new(config);
        let ops = Arc::new(Operations::new());
        let synth = Arc::new(FakeSynth::default());
        let speech = Arc::new(SpeechController::new(
            Arc::new(player.clone()),
            Arc::clone(&synth) as Arc<dyn Synthesizer>,
            TtsCache::new(&config.cache_dir),
            Arc::clone(&ops),
            &config.phrases.canned(),
        ));
        let session = Arc::new(Session::new(
            config.phrases.system_turn(),
            config.session.max_turns,
        ));

        Self {
            config,
            recorder: Arc::new(recorder),
            transcriber: Arc::new(transcriber),
            chatter: Arc::new(chatter),
            synth,
            player,
            mixer: Arc::new(FakeMixer::default()),
            speech,
            session,
            ops,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let services = Collaborators {
            recorder: Arc::clone(&self.recorder) as Arc<dyn Recorder>,
            transcriber: Arc::clone(&self.transcriber) as Arc<dyn Transcriber>,
            chatter: Arc::clone(&self.chatter) as Arc<dyn Chatter>,
            speech: Arc::clone(&self.speech),
            mixer: Arc::clone(&self.mixer) as Arc<dyn Mixer>,
            stop_listener: None,
        };
        Orchestrator::new(
            Arc::clone(&self.config),
            services,
            Arc::clone(&self.session),
            Arc::clone(&self.ops),
        )
    }
}
