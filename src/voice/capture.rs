//! Audio capture from the microphone
//!
//! A capture is two processes in one group: a recorder writing raw PCM to
//! stdout, and a `sox` filter stage (band-pass, gain, silence detection) that
//! exits on its own once speech is followed by enough silence. The recorder's
//! output is teed: every chunk goes to the live monitoring channel for voice
//! activity detection, and into the filter. The filter's output is buffered
//! and handed over as a WAV file when the pipeline stops.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use super::process::{ExitKind, ProcessGroup, ProcessRegistry, StopSignal, in_group};
use super::wav::pcm_to_wav;
use crate::config::CaptureConfig;
use crate::{Error, Result};

/// Bytes read from a pipe at a time (~32ms at 16kHz)
const READ_CHUNK: usize = 1024;

/// Monitoring chunks buffered before new ones are dropped
const MONITOR_CHANNEL_SIZE: usize = 256;

/// How a recording attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// The filter stage heard speech followed by silence
    CompletedOnSilence,
    /// Stopped at the maximum recording length
    Truncated,
    /// Idle timer fired with no voice activity
    TimedOut,
    /// Stopped by a stop intent, shutdown, or capture failure
    Aborted,
}

impl CompletionKind {
    /// Whether the captured audio should be processed as a turn
    #[must_use]
    pub const fn has_turn(self) -> bool {
        matches!(self, Self::CompletedOnSilence | Self::Truncated)
    }
}

/// A finished recording attempt
#[derive(Debug)]
pub struct RecordingAttempt {
    /// When capture started
    pub started_at: Instant,
    /// Encoded WAV audio (empty when nothing was captured)
    pub audio: Vec<u8>,
    /// How the attempt ended
    pub kind: CompletionKind,
}

/// A live capture pipeline
///
/// `monitor` delivers raw PCM as it is captured; `completion` resolves with
/// the encoded recording once the pipeline stops, whether on its own or via
/// `group.terminate()`.
pub struct CaptureStream {
    /// Raw 16-bit mono PCM chunks, live
    pub monitor: mpsc::Receiver<Vec<u8>>,
    /// Final WAV audio
    pub completion: oneshot::Receiver<Result<Vec<u8>>>,
    /// Handle that stops the whole pipeline
    pub group: ProcessGroup,
}

impl CaptureStream {
    /// Stop the pipeline and all its sub-processes
    ///
    /// Idempotent; safe after the pipeline already stopped.
    pub fn stop(&self) {
        self.group.terminate();
    }
}

/// Something that can start a capture pipeline
pub trait Recorder: Send + Sync {
    /// Start capturing
    ///
    /// # Errors
    ///
    /// Returns `Error::Capture` if the pipeline cannot be spawned
    fn start(&self) -> Result<CaptureStream>;
}

/// Captures audio with `arecord` (Linux) or `sox -d`, filtered through `sox`
pub struct AudioCapture {
    config: CaptureConfig,
    registry: ProcessRegistry,
}

impl AudioCapture {
    /// Create a capture adapter
    #[must_use]
    pub const fn new(config: CaptureConfig, registry: ProcessRegistry) -> Self {
        Self { config, registry }
    }

    /// Sample rate of captured audio
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

impl Recorder for AudioCapture {
    fn start(&self) -> Result<CaptureStream> {
        let (program, args) = recorder_command(&self.config);

        let mut recorder_cmd = Command::new(&program);
        in_group(&mut recorder_cmd, None)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if cfg!(not(target_os = "linux")) {
            if let Some(device) = &self.config.device {
                recorder_cmd.env("AUDIODEV", device);
            }
        }

        let mut recorder = recorder_cmd
            .spawn()
            .map_err(|e| Error::Capture(format!("failed to spawn {program}: {e}")))?;

        let group = ProcessGroup::new("capture", recorder.id(), StopSignal::Terminate);
        self.registry.register(&group);

        let mut filter_cmd = Command::new("sox");
        in_group(&mut filter_cmd, recorder.id())
            .args(filter_args(&self.config))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut filter = match filter_cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                group.terminate();
                let _ = recorder.start_kill();
                return Err(Error::Capture(format!("failed to spawn sox filter: {e}")));
            }
        };

        let (Some(recorder_out), Some(filter_in), Some(filter_out)) = (
            recorder.stdout.take(),
            filter.stdin.take(),
            filter.stdout.take(),
        ) else {
            group.terminate();
            return Err(Error::Capture("capture pipes unavailable".to_string()));
        };

        let (monitor_tx, monitor_rx) = mpsc::channel(MONITOR_CHANNEL_SIZE);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(pump_recorder(
            recorder_out,
            filter_in,
            monitor_tx,
            group.clone(),
        ));
        tokio::spawn(collect_filtered(
            recorder,
            filter,
            filter_out,
            self.config.sample_rate,
            done_tx,
            group.clone(),
        ));

        tracing::debug!(
            program = %program,
            pgid = ?group.pgid(),
            sample_rate = self.config.sample_rate,
            "capture started"
        );

        Ok(CaptureStream {
            monitor: monitor_rx,
            completion: done_rx,
            group,
        })
    }
}

/// Recorder program and arguments for this platform
#[must_use]
pub fn recorder_command(config: &CaptureConfig) -> (String, Vec<String>) {
    let rate = config.sample_rate.to_string();

    if cfg!(target_os = "linux") {
        let mut args = vec!["-q".to_string()];
        if let Some(device) = &config.device {
            args.extend(["-D".to_string(), device.clone()]);
        }
        args.extend(
            ["-f", "S16_LE", "-r", &rate, "-c", "1", "-t", "raw"]
                .into_iter()
                .map(String::from),
        );
        ("arecord".to_string(), args)
    } else {
        let mut args: Vec<String> = ["-q", "-d"].into_iter().map(String::from).collect();
        args.extend(raw_format_args(&rate));
        args.push("-".to_string());
        ("sox".to_string(), args)
    }
}

/// Arguments for the `sox` filter stage
///
/// Reads raw PCM on stdin, writes raw PCM on stdout, and exits after
/// `silence_duration` below `silence_threshold` once sound has started.
#[must_use]
pub fn filter_args(config: &CaptureConfig) -> Vec<String> {
    let rate = config.sample_rate.to_string();
    let threshold = format!("{}%", config.silence_threshold);

    let mut args = vec!["-q".to_string()];
    args.extend(raw_format_args(&rate));
    args.push("-".to_string());
    args.extend(raw_format_args(&rate));
    args.push("-".to_string());

    if let Some((low, high)) = config.band_pass {
        args.extend(["sinc".to_string(), format!("{low}-{high}")]);
    }
    if let Some(gain) = config.gain_db {
        args.extend(["gain".to_string(), format!("{gain}")]);
    }

    args.extend([
        "silence".to_string(),
        "1".to_string(),
        format!("{:.2}", config.onset_duration.as_secs_f32()),
        threshold.clone(),
        "1".to_string(),
        format!("{:.2}", config.silence_duration.as_secs_f32()),
        threshold,
    ]);

    args
}

fn raw_format_args(rate: &str) -> Vec<String> {
    ["-t", "raw", "-b", "16", "-e", "signed-integer", "-r", rate, "-c", "1"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Tee recorder output into the monitor channel and the filter stage
async fn pump_recorder(
    mut recorder_out: ChildStdout,
    filter_in: ChildStdin,
    monitor: mpsc::Sender<Vec<u8>>,
    group: ProcessGroup,
) {
    let mut filter_in = Some(filter_in);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = tokio::select! {
            () = group.terminated() => break,
            read = recorder_out.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "recorder read failed");
                    break;
                }
            },
        };

        let chunk = buf[..n].to_vec();

        if let Some(stdin) = filter_in.as_mut() {
            // The filter exits on its own after silence; later writes are moot
            if stdin.write_all(&chunk).await.is_err() {
                filter_in = None;
            }
        }

        if monitor.try_send(chunk).is_err() {
            tracing::trace!("monitor channel full or closed, chunk dropped");
        }
    }

    // Closing stdin lets the filter flush and exit
    drop(filter_in);
}

/// Buffer the filter output, then stop the recorder and report the result
async fn collect_filtered(
    mut recorder: Child,
    mut filter: Child,
    mut filter_out: ChildStdout,
    sample_rate: u32,
    done: oneshot::Sender<Result<Vec<u8>>>,
    group: ProcessGroup,
) {
    let mut pcm = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut killed = false;

    loop {
        tokio::select! {
            () = group.terminated(), if !killed => {
                // Fallback for platforms without process groups
                let _ = filter.start_kill();
                let _ = recorder.start_kill();
                killed = true;
            }
            read = filter_out.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => pcm.extend_from_slice(&buf[..n]),
                Err(e) => {
                    tracing::debug!(error = %e, "filter read failed");
                    break;
                }
            },
        }
    }

    let stopping = group.is_terminated();

    // Did the recorder die before the filter finished?
    let recorder_early = recorder.try_wait().ok().flatten().map(ExitKind::classify);

    group.terminate();
    let _ = recorder.start_kill();

    let filter_exit = filter.wait().await.map(ExitKind::classify);
    let _ = recorder.wait().await;
    group.mark_exited();

    let mut failure = None;
    if let Some(kind) = recorder_early {
        if kind.is_failure(stopping) {
            failure = Some(format!("recorder exited early: {kind:?}"));
        }
    }
    if let Ok(kind) = filter_exit {
        if kind.is_failure(stopping) {
            failure = Some(format!("filter stage failed: {kind:?}"));
        }
    }

    let result = match failure {
        Some(reason) if pcm.is_empty() => {
            tracing::warn!(reason = %reason, "capture failed");
            Err(Error::Capture(reason))
        }
        _ if pcm.is_empty() => Ok(Vec::new()),
        other => {
            if let Some(reason) = other {
                tracing::warn!(reason = %reason, bytes = pcm.len(), "capture ended abnormally, keeping audio");
            }
            pcm_to_wav(&pcm, sample_rate)
        }
    };

    tracing::debug!(pcm_bytes = pcm.len(), stopping, "capture finished");
    let _ = done.send(result);
}
