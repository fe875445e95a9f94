//! Speech playback controller and TTS cache
//!
//! [`SpeechController::speak`] owns the `speaking` flag: it interrupts any
//! utterance in progress, plays from the cache or streams fresh synthesis to
//! the player, and clears the flag on every exit path. [`cancel`] is the
//! barge-in entry point and may be called at any moment.
//!
//! [`cancel`]: SpeechController::cancel

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::intent::normalize;
use crate::session::Operations;
use crate::voice::playback::{PlaybackSource, Player};
use crate::voice::process::ProcessGroup;
use crate::voice::tts::Synthesizer;
use crate::{Error, Result};

/// Extension of cached PCM files
const CACHE_EXT: &str = "pcm";

/// How an utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Played to the end
    Completed,
    /// Cut off by barge-in or a newer utterance
    Interrupted,
}

/// Content-addressed store of synthesized speech
#[derive(Debug, Clone)]
pub struct TtsCache {
    dir: PathBuf,
}

impl TtsCache {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding cached audio
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache key: hex SHA-256 of `voice:normalized text`
    #[must_use]
    pub fn key(voice: &str, text: &str) -> String {
        let digest = Sha256::digest(format!("{voice}:{}", normalize(text)).as_bytes());
        hex::encode(digest)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{CACHE_EXT}"))
    }

    /// Cached audio file for `(voice, text)`, if present
    #[must_use]
    pub fn lookup(&self, voice: &str, text: &str) -> Option<PathBuf> {
        let path = self.path_for(&Self::key(voice, text));
        std::fs::metadata(&path)
            .is_ok_and(|m| m.is_file() && m.len() > 0)
            .then_some(path)
    }

    /// Store audio for `(voice, text)`
    ///
    /// Written to a temporary file and renamed into place, so readers never
    /// see a partial entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cache` if the file cannot be written
    pub fn store(&self, voice: &str, text: &str, audio: &[u8]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Cache(format!("failed to create {}: {e}", self.dir.display())))?;

        let path = self.path_for(&Self::key(voice, text));
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::Cache(format!("failed to create temp file: {e}")))?;
        file.write_all(audio)
            .map_err(|e| Error::Cache(format!("failed to write cache entry: {e}")))?;
        file.persist(&path)
            .map_err(|e| Error::Cache(format!("failed to persist cache entry: {e}")))?;

        tracing::debug!(path = %path.display(), bytes = audio.len(), "cached speech");
        Ok(path)
    }

    /// Delete every cached entry
    ///
    /// # Errors
    ///
    /// Returns `Error::Cache` if the directory cannot be read
    pub fn clear(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Cache(format!("failed to read cache: {e}"))),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == CACHE_EXT)
                && std::fs::remove_file(&path).is_ok()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

struct Utterance {
    id: u64,
    cancel: CancellationToken,
    group: Option<ProcessGroup>,
}

/// Starts, streams, and interrupts spoken replies
pub struct SpeechController {
    player: Arc<dyn Player>,
    synth: Arc<dyn Synthesizer>,
    cache: TtsCache,
    ops: Arc<Operations>,
    canned: Vec<String>,
    current: Mutex<Option<Utterance>>,
    next_id: AtomicU64,
}

/// Clears the utterance slot when `speak` exits by any path
struct UtteranceGuard<'a> {
    controller: &'a SpeechController,
    id: u64,
}

impl Drop for UtteranceGuard<'_> {
    fn drop(&mut self) {
        self.controller.release(self.id);
    }
}

impl SpeechController {
    /// Create a controller
    ///
    /// `canned` phrases are written to the cache after they first play.
    #[must_use]
    pub fn new(
        player: Arc<dyn Player>,
        synth: Arc<dyn Synthesizer>,
        cache: TtsCache,
        ops: Arc<Operations>,
        canned: &[String],
    ) -> Self {
        Self {
            player,
            synth,
            cache,
            ops,
            canned: canned.iter().map(|c| normalize(c)).collect(),
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Utterance>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cache backing this controller
    #[must_use]
    pub const fn cache(&self) -> &TtsCache {
        &self.cache
    }

    /// Stop the current utterance, if any
    ///
    /// Kills the player outright and clears `speaking`. Idempotent.
    pub fn cancel(&self) -> bool {
        let Some(utterance) = self.slot().take() else {
            return false;
        };

        utterance.cancel.cancel();
        if let Some(group) = &utterance.group {
            group.terminate();
        }
        self.ops.set_speaking(false);

        tracing::debug!(utterance = utterance.id, "speech cancelled");
        true
    }

    fn release(&self, id: u64) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|u| u.id == id) {
            slot.take();
            self.ops.set_speaking(false);
        }
    }

    /// Attach the player to the utterance so `cancel` can kill it
    ///
    /// Returns `false` if the utterance was cancelled in the meantime.
    fn attach(&self, id: u64, group: ProcessGroup) -> bool {
        let mut slot = self.slot();
        match slot.as_mut() {
            Some(utterance) if utterance.id == id => {
                utterance.group = Some(group);
                true
            }
            _ => {
                group.terminate();
                false
            }
        }
    }

    /// Speak `text`, interrupting anything already playing
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails; `speaking` is cleared
    /// either way
    pub async fn speak(&self, text: &str) -> Result<SpeakOutcome> {
        self.speak_if(text, || true).await
    }

    /// Speak `text` only if `still_wanted` holds when the utterance starts
    ///
    /// The check runs under the same lock `cancel` takes, so a caller that
    /// invalidates the condition and then calls `cancel` never hears this
    /// utterance.
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    pub async fn speak_if<F>(&self, text: &str, still_wanted: F) -> Result<SpeakOutcome>
    where
        F: Fn() -> bool + Send + Sync,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut slot = self.slot();
            if !still_wanted() {
                return Ok(SpeakOutcome::Interrupted);
            }
            if let Some(previous) = slot.take() {
                previous.cancel.cancel();
                if let Some(group) = &previous.group {
                    group.terminate();
                }
                tracing::debug!(utterance = previous.id, "speech interrupted by newer utterance");
            }
            *slot = Some(Utterance {
                id,
                cancel: cancel.clone(),
                group: None,
            });
            self.ops.set_speaking(true);
        }
        let _guard = UtteranceGuard {
            controller: self,
            id,
        };

        let voice = self.synth.voice().to_string();

        if let Some(path) = self.cache.lookup(&voice, text) {
            tracing::debug!(path = %path.display(), "speaking from cache");
            return self.play_cached(id, &cancel, path).await;
        }

        self.play_streamed(id, &cancel, &voice, text).await
    }

    async fn play_cached(
        &self,
        id: u64,
        cancel: &CancellationToken,
        path: PathBuf,
    ) -> Result<SpeakOutcome> {
        let mut playback = self.player.start(&PlaybackSource::RawFile(path))?;
        if !self.attach(id, playback.group()) {
            return Ok(SpeakOutcome::Interrupted);
        }

        playback.finish().await?;
        Ok(if cancel.is_cancelled() {
            SpeakOutcome::Interrupted
        } else {
            SpeakOutcome::Completed
        })
    }

    async fn play_streamed(
        &self,
        id: u64,
        cancel: &CancellationToken,
        voice: &str,
        text: &str,
    ) -> Result<SpeakOutcome> {
        let started = Instant::now();

        let mut stream = tokio::select! {
            () = cancel.cancelled() => return Ok(SpeakOutcome::Interrupted),
            stream = self.synth.synthesize(text) => stream?,
        };

        let mut playback = self.player.start(&PlaybackSource::Stream)?;
        if !self.attach(id, playback.group()) {
            return Ok(SpeakOutcome::Interrupted);
        }

        let mut audio = Vec::new();
        let mut first_byte = true;

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            if first_byte {
                first_byte = false;
                tracing::debug!(
                    first_byte_ms = started.elapsed().as_millis(),
                    "first TTS audio received"
                );
            }

            audio.extend_from_slice(&chunk);
            if !playback.write(&chunk).await {
                break;
            }
        }

        playback.finish().await?;

        if cancel.is_cancelled() {
            return Ok(SpeakOutcome::Interrupted);
        }

        if !audio.is_empty() && self.canned.contains(&normalize(text)) {
            if let Err(e) = self.cache.store(voice, text, &audio) {
                tracing::warn!(error = %e, "failed to cache speech");
            }
        }

        tracing::debug!(
            bytes = audio.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "utterance complete"
        );
        Ok(SpeakOutcome::Completed)
    }

    /// Start a chime without touching `speaking`
    ///
    /// The returned handle stops it early.
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the player cannot start
    pub fn start_chime(&self, path: &Path) -> Result<ProcessGroup> {
        let mut playback = self
            .player
            .start(&PlaybackSource::WavFile(path.to_path_buf()))?;
        let group = playback.group();

        tokio::spawn(async move {
            if let Err(e) = playback.finish().await {
                tracing::debug!(error = %e, "chime playback failed");
            }
        });

        Ok(group)
    }

    /// Play a chime to the end
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the player fails
    pub async fn play_chime(&self, path: &Path) -> Result<()> {
        let mut playback = self
            .player
            .start(&PlaybackSource::WavFile(path.to_path_buf()))?;
        playback.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_case_and_punctuation() {
        assert_eq!(
            TtsCache::key("alloy", "Hey, what's up?"),
            TtsCache::key("alloy", "hey whats up")
        );
        assert_ne!(
            TtsCache::key("alloy", "hey whats up"),
            TtsCache::key("nova", "hey whats up")
        );
        assert_eq!(TtsCache::key("alloy", "x").len(), 64);
    }

    #[test]
    fn store_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TtsCache::new(dir.path().join("tts"));

        assert!(cache.lookup("alloy", "hello").is_none());
        let path = cache.store("alloy", "hello", &[1, 2, 3, 4]).unwrap();
        assert_eq!(cache.lookup("alloy", "Hello!"), Some(path.clone()));
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3, 4]);

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.lookup("alloy", "hello").is_none());
    }

    #[test]
    fn clearing_missing_cache_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TtsCache::new(dir.path().join("absent"));
        assert_eq!(cache.clear().unwrap(), 0);
    }
}
