//! winterfresh - always-on voice assistant
//!
//! This library provides the pieces of the assistant:
//! - Wake and stop listeners driven by external detector processes
//! - Microphone capture that ends on silence, with energy-based barge-in
//! - Speech-to-text, chat, and text-to-speech gateways
//! - Speech playback with a cache for canned phrases
//! - A per-session orchestrator and a supervisor that restarts on failure
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Supervisor                        │
//! │        wake → session → sleep → restart             │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Orchestrator                        │
//! │   Capture  │  VAD  │  Turn pipeline  │  Speech      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │           Providers and child processes              │
//! │   STT  │  Chat  │  TTS  │  arecord/sox/aplay        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod chat;
pub mod config;
pub mod error;
pub mod intent;
pub mod mixer;
pub mod orchestrator;
pub mod preflight;
pub mod session;
pub mod speech;
pub mod supervisor;
pub mod voice;

pub use chat::{ChatClient, Chatter};
pub use config::Config;
pub use error::{Error, Result};
pub use mixer::{AlsaMixer, Mixer};
pub use orchestrator::{Collaborators, Orchestrator, SessionEnd};
pub use session::{Operations, Session, Turn};
pub use speech::{SpeakOutcome, SpeechController, TtsCache};
pub use supervisor::{Runtime, Startup, Supervisor};
