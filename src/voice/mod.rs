//! Voice processing module
//!
//! Handles audio capture, voice activity detection, playback, wake/stop
//! listeners, and the STT/TTS providers.

pub mod capture;
pub mod listener;
pub mod playback;
pub mod process;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod wav;

pub use capture::{AudioCapture, CaptureStream, CompletionKind, Recorder, RecordingAttempt};
pub use listener::{ListenOutcome, Listener, MarkerListener};
pub use playback::{Playback, PlaybackSource, Player, ProcessPlayer};
pub use process::{ProcessGroup, ProcessRegistry};
pub use stt::{SpeechToText, Transcriber};
pub use tts::{AudioStream, Synthesizer, TextToSpeech};
pub use vad::{VadEvent, VoiceActivityDetector};
pub use wav::{check_wav, is_valid_wav, pcm_to_wav};
