//! Speech playback controller integration tests

use std::sync::Arc;
use std::time::Duration;

use winterfresh::session::Operations;
use winterfresh::speech::{SpeakOutcome, SpeechController, TtsCache};
use winterfresh::voice::playback::PlaybackSource;
use winterfresh::voice::tts::Synthesizer;

mod common;

use common::{FakePlayer, FakeSynth};

struct Harness {
    _dir: tempfile::TempDir,
    synth: Arc<FakeSynth>,
    player: FakePlayer,
    ops: Arc<Operations>,
    speech: Arc<SpeechController>,
}

fn harness(player: FakePlayer, canned: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let synth = Arc::new(FakeSynth::default());
    let ops = Arc::new(Operations::new());
    let canned: Vec<String> = canned.iter().map(ToString::to_string).collect();
    let speech = Arc::new(SpeechController::new(
        Arc::new(player.clone()),
        Arc::clone(&synth) as Arc<dyn Synthesizer>,
        TtsCache::new(dir.path().join("tts")),
        Arc::clone(&ops),
        &canned,
    ));

    Harness {
        _dir: dir,
        synth,
        player,
        ops,
        speech,
    }
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_cancel_stops_playback() {
    const LONG: &str = "This is a very long answer that keeps going.";
    let h = harness(FakePlayer::holding(LONG), &[]);

    let speech = Arc::clone(&h.speech);
    let task = tokio::spawn(async move { speech.speak(LONG).await });

    // Wait for the player to be holding the utterance
    while h.player.played().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.ops.is_speaking());

    assert!(h.speech.cancel());
    assert!(!h.ops.is_speaking());
    assert!(h.player.played()[0].group.is_terminated());

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, SpeakOutcome::Interrupted);

    // Nothing left to cancel, and the next utterance is not blocked
    assert!(!h.speech.cancel());
    let outcome = h.speech.speak("Short one.").await.unwrap();
    assert_eq!(outcome, SpeakOutcome::Completed);
    assert!(!h.ops.is_speaking());
}

#[tokio::test(start_paused = true)]
async fn test_newer_utterance_interrupts_older() {
    const FIRST: &str = "First thing I was saying.";
    let h = harness(FakePlayer::holding(FIRST), &[]);

    let speech = Arc::clone(&h.speech);
    let first = tokio::spawn(async move { speech.speak(FIRST).await });
    while h.player.played().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let second = h.speech.speak("Something else.").await.unwrap();

    assert_eq!(second, SpeakOutcome::Completed);
    assert_eq!(first.await.unwrap().unwrap(), SpeakOutcome::Interrupted);
    assert!(h.player.played()[0].group.is_terminated());
}

#[tokio::test]
async fn test_canned_phrase_served_from_cache() {
    const GREETING: &str = "Hey, what's up?";
    let h = harness(FakePlayer::default(), &[GREETING]);

    assert_eq!(h.speech.speak(GREETING).await.unwrap(), SpeakOutcome::Completed);
    assert_eq!(h.speech.speak(GREETING).await.unwrap(), SpeakOutcome::Completed);

    // Only the first call reached the provider
    assert_eq!(h.synth.requests(), vec![GREETING.to_string()]);

    let played = h.player.played();
    assert_eq!(played.len(), 2);
    assert_eq!(played[0].source, PlaybackSource::Stream);
    assert!(matches!(played[1].source, PlaybackSource::RawFile(_)));
    assert_eq!(played[0].bytes, played[1].bytes);
    assert!(h.speech.cache().lookup("test-voice", GREETING).is_some());
}

#[tokio::test]
async fn test_cache_ignores_case_and_punctuation() {
    let h = harness(FakePlayer::default(), &["Okay, going to sleep."]);

    h.speech.speak("Okay, going to sleep.").await.unwrap();
    h.speech.speak("okay going to sleep").await.unwrap();

    assert_eq!(h.synth.requests().len(), 1);
}

#[tokio::test]
async fn test_replies_are_not_cached() {
    let h = harness(FakePlayer::default(), &["Hey, what's up?"]);

    h.speech.speak("It is noon.").await.unwrap();
    h.speech.speak("It is noon.").await.unwrap();

    assert_eq!(h.synth.requests().len(), 2);
    assert!(h.speech.cache().lookup("test-voice", "It is noon.").is_none());
}

#[tokio::test]
async fn test_unwanted_utterance_never_starts() {
    let h = harness(FakePlayer::default(), &[]);

    let outcome = h.speech.speak_if("Too late.", || false).await.unwrap();

    assert_eq!(outcome, SpeakOutcome::Interrupted);
    assert!(h.synth.requests().is_empty());
    assert!(h.player.played().is_empty());
    assert!(!h.ops.is_speaking());
}

#[tokio::test]
async fn test_interrupted_canned_phrase_is_not_cached() {
    const GREETING: &str = "Hey, what's up?";
    let h = harness(FakePlayer::holding(GREETING), &[GREETING]);

    let speech = Arc::clone(&h.speech);
    let task = tokio::spawn(async move { speech.speak(GREETING).await });
    while h.player.played().is_empty() {
        tokio::task::yield_now().await;
    }
    while h.player.played()[0].bytes.len() < GREETING.len() {
        tokio::task::yield_now().await;
    }

    h.speech.cancel();
    assert_eq!(task.await.unwrap().unwrap(), SpeakOutcome::Interrupted);
    assert!(h.speech.cache().lookup("test-voice", GREETING).is_none());
}
