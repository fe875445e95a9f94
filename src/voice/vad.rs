//! Voice activity detection
//!
//! Watches the live monitoring stream of a recording and reports when speech
//! is present. Deciding when a recording ends is left to the capture
//! pipeline's own silence stage; this detector only signals presence early
//! enough to interrupt playback and hold off the idle timer.

use super::wav::pcm_to_samples;

/// Event emitted by the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    /// A window crossed the threshold
    VoiceDetected {
        /// RMS of the window that crossed
        rms: f32,
    },
}

/// RMS voice-activity detector over 16-bit mono PCM
///
/// Nothing is evaluated until `min_bytes` have been observed, which swallows
/// the click at the start of a capture and very short noise bursts. After
/// that, each chunk is one window and a single window over the threshold is
/// enough to flag voice.
#[derive(Debug)]
pub struct VoiceActivityDetector {
    threshold: f32,
    min_bytes: usize,
    seen_bytes: usize,
    carry: Option<u8>,
    last_rms: f32,
    detections: u64,
}

impl VoiceActivityDetector {
    /// Create a detector
    ///
    /// # Arguments
    ///
    /// * `threshold` - RMS level (fraction of full scale) that counts as voice
    /// * `min_bytes` - bytes to observe before evaluating
    #[must_use]
    pub const fn new(threshold: f32, min_bytes: usize) -> Self {
        Self {
            threshold,
            min_bytes,
            seen_bytes: 0,
            carry: None,
            last_rms: 0.0,
            detections: 0,
        }
    }

    /// Feed the next chunk of the monitoring stream
    pub fn process(&mut self, chunk: &[u8]) -> Option<VadEvent> {
        if chunk.is_empty() {
            return None;
        }
        self.seen_bytes = self.seen_bytes.saturating_add(chunk.len());

        // Re-align samples split across chunk boundaries
        let mut aligned = Vec::with_capacity(chunk.len() + 1);
        if let Some(byte) = self.carry.take() {
            aligned.push(byte);
        }
        aligned.extend_from_slice(chunk);
        if aligned.len() % 2 == 1 {
            self.carry = aligned.pop();
        }

        if self.seen_bytes < self.min_bytes {
            return None;
        }

        let rms = calculate_energy(&pcm_to_samples(&aligned));
        self.last_rms = rms;

        tracing::trace!(rms, bytes = aligned.len(), "vad window");

        if rms > self.threshold {
            self.detections += 1;
            Some(VadEvent::VoiceDetected { rms })
        } else {
            None
        }
    }

    /// RMS of the most recently evaluated window
    #[must_use]
    pub const fn last_rms(&self) -> f32 {
        self.last_rms
    }

    /// Number of windows flagged as voice
    #[must_use]
    pub const fn detections(&self) -> u64 {
        self.detections
    }

    /// Bytes observed so far
    #[must_use]
    pub const fn seen_bytes(&self) -> usize {
        self.seen_bytes
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(samples: usize, amplitude: i16) -> Vec<u8> {
        (0..samples)
            .flat_map(|i| {
                let s = if i % 2 == 0 { amplitude } else { -amplitude };
                s.to_le_bytes()
            })
            .collect()
    }

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(calculate_energy(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(calculate_energy(&loud) > 0.4);
    }

    #[test]
    fn short_burst_below_byte_floor_is_ignored() {
        let mut vad = VoiceActivityDetector::new(0.02, 1000);
        assert_eq!(vad.process(&tone(200, 16_000)), None);
        assert_eq!(vad.seen_bytes(), 400);
        assert_eq!(vad.detections(), 0);
    }

    #[test]
    fn loud_window_after_floor_flags_voice() {
        let mut vad = VoiceActivityDetector::new(0.02, 1000);
        assert_eq!(vad.process(&tone(400, 0)), None);
        let event = vad.process(&tone(400, 16_000));
        assert!(matches!(event, Some(VadEvent::VoiceDetected { rms }) if rms > 0.4));
        assert_eq!(vad.detections(), 1);
    }

    #[test]
    fn quiet_window_stays_silent() {
        let mut vad = VoiceActivityDetector::new(0.02, 0);
        assert_eq!(vad.process(&tone(800, 100)), None);
        assert!(vad.last_rms() < 0.02);
    }

    #[test]
    fn odd_chunks_keep_sample_alignment() {
        let mut vad = VoiceActivityDetector::new(0.02, 0);
        let bytes = tone(10, 16_000);
        assert!(vad.process(&bytes[..3]).is_some());
        assert!(vad.process(&bytes[3..]).is_some());
        assert!(vad.last_rms() > 0.4);
    }
}
