use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use winterfresh::chat::ChatClient;
use winterfresh::mixer::AlsaMixer;
use winterfresh::orchestrator::{Collaborators, Orchestrator};
use winterfresh::preflight;
use winterfresh::session::{Operations, Session};
use winterfresh::speech::{SpeechController, TtsCache};
use winterfresh::supervisor::{Runtime, Startup, Supervisor};
use winterfresh::voice::capture::{AudioCapture, Recorder};
use winterfresh::voice::listener::{Listener, MarkerListener};
use winterfresh::voice::playback::ProcessPlayer;
use winterfresh::voice::process::ProcessRegistry;
use winterfresh::voice::stt::SpeechToText;
use winterfresh::voice::tts::{Synthesizer, TextToSpeech};
use winterfresh::voice::vad::{VoiceActivityDetector, calculate_energy};
use winterfresh::voice::wav::pcm_to_samples;
use winterfresh::Config;

/// winterfresh - always-on voice assistant
#[derive(Parser)]
#[command(name = "winterfresh", version, about)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "WINTERFRESH_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run startup checks and report
    Check,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Synthesize and speak a phrase twice, the second time from cache
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Delete cached speech audio
    ClearCache,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,winterfresh=info",
        1 => "info,winterfresh=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_from(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Check => check(&config),
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestTts { text } => test_tts(&config, &text).await,
            Command::ClearCache => clear_cache(&config),
        };
    }

    preflight::run(&config).into_result()?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal.cancel();
        }
    });

    let config = Arc::new(config);
    let mut supervisor = Supervisor::new(startup(Arc::clone(&config)), &config.session);

    tracing::info!(
        wake = ?config.wake.command,
        chat = ?config.providers.chat,
        "winterfresh ready"
    );

    supervisor.run(&shutdown).await?;
    Ok(())
}

/// Builds a fresh runtime: new process registry, session, and collaborators
fn startup(config: Arc<Config>) -> Startup {
    Box::new(move || {
        let registry = ProcessRegistry::new();
        let ops = Arc::new(Operations::new());
        let session = Arc::new(Session::new(
            config.phrases.system_turn(),
            config.session.max_turns,
        ));

        let speech = Arc::new(SpeechController::new(
            Arc::new(ProcessPlayer::new(config.playback.clone(), registry.clone())),
            Arc::new(TextToSpeech::from_config(&config)?),
            TtsCache::new(&config.cache_dir),
            Arc::clone(&ops),
            &config.phrases.canned(),
        ));

        let stop_listener = config.stop_listener.clone().map(|listener| {
            Arc::new(MarkerListener::new(
                "stop",
                listener,
                config.phrases.wake_words.clone(),
                registry.clone(),
            )) as Arc<dyn Listener>
        });

        let services = Collaborators {
            recorder: Arc::new(AudioCapture::new(config.capture.clone(), registry.clone())),
            transcriber: Arc::new(SpeechToText::from_config(&config)?),
            chatter: Arc::new(ChatClient::from_config(&config)?),
            speech,
            mixer: Arc::new(AlsaMixer::new(config.mixer.clone())),
            stop_listener,
        };

        let wake = Arc::new(MarkerListener::new(
            "wake",
            config.wake.clone(),
            config.phrases.wake_words.clone(),
            registry.clone(),
        ));

        Ok(Runtime {
            wake,
            orchestrator: Orchestrator::new(Arc::clone(&config), services, session, ops),
            registry,
        })
    })
}

/// Print the preflight report
fn check(config: &Config) -> anyhow::Result<()> {
    let report = preflight::run(config);
    for check in &report.checks {
        let mark = if check.ok {
            "ok"
        } else if check.required {
            "FAIL"
        } else {
            "warn"
        };
        println!("[{mark:>4}] {}: {}", check.name, check.detail);
    }
    report.into_result()?;
    println!("\nAll required checks passed");
    Ok(())
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let registry = ProcessRegistry::new();
    let capture = AudioCapture::new(config.capture.clone(), registry.clone());
    let mut stream = capture.start()?;
    let mut vad = VoiceActivityDetector::new(config.capture.vad_threshold, 0);

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("VAD threshold: {:.4}", config.capture.vad_threshold);
    println!("---");

    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut second = Vec::new();
        loop {
            tokio::select! {
                chunk = stream.monitor.recv() => match chunk {
                    Some(chunk) => {
                        vad.process(&chunk);
                        second.extend_from_slice(&chunk);
                    }
                    None => break,
                },
                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        let energy = calculate_energy(&pcm_to_samples(&second));

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
        let voice = if energy > config.capture.vad_threshold {
            "voice"
        } else {
            "     "
        };

        println!("[{:2}s] RMS: {energy:.4} {voice} | [{meter}]", i + 1);
    }

    stream.stop();
    registry.terminate_all();

    println!("\n---");
    println!("Windows flagged as voice: {}", vad.detections());
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Set WINTERFRESH_CAPTURE_DEVICE or capture.device in the config");

    Ok(())
}

/// Test TTS output through the speech controller
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let registry = ProcessRegistry::new();
    let synth = Arc::new(TextToSpeech::from_config(config)?);
    let cache = TtsCache::new(&config.cache_dir);
    let cached = cache.lookup(synth.voice(), text).is_some();

    let speech = SpeechController::new(
        Arc::new(ProcessPlayer::new(config.playback.clone(), registry.clone())),
        synth,
        cache,
        Arc::new(Operations::new()),
        &[text.to_string()],
    );

    println!("First pass ({})...", if cached { "cached" } else { "streamed" });
    let outcome = speech.speak(text).await?;
    println!("  {outcome:?}");

    println!("Second pass (cached)...");
    let outcome = speech.speak(text).await?;
    println!("  {outcome:?}");

    registry.terminate_all();

    println!("\n---");
    println!("Cache directory: {}", speech.cache().dir().display());
    println!("If you heard the phrase twice, TTS and playback are working!");

    Ok(())
}

/// Delete cached TTS audio
fn clear_cache(config: &Config) -> anyhow::Result<()> {
    let cache = TtsCache::new(&config.cache_dir);
    let removed = cache.clear()?;
    println!("Removed {removed} cached phrase(s) from {}", cache.dir().display());
    Ok(())
}
