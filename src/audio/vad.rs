//! # Voice Activity Analysis
//!
//! Computes a speech-ratio score over the most recent stretch of buffered
//! PCM. The score is a pause-detection heuristic for the chunk policy, never
//! a correctness gate: when only the fallback classifier is available the
//! analyzer reports a pause threshold that can never fire, and chunking
//! degrades to pure size-based triggering.

use crate::audio::format::{BYTES_PER_SEC, SAMPLE_WIDTH};
use crate::config::StreamingConfig;
use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

/// Pause threshold installed when no real classifier is available. The
/// speech ratio is always `>= 0`, so `ratio < -1.0` can never hold and the
/// VAD readiness branch cannot fire.
pub const FALLBACK_PAUSE_THRESHOLD: f32 = -1.0;

/// Energy floor (RMS over normalized samples) above which a frame counts as
/// speech for the energy classifier.
const FRAME_ENERGY_THRESHOLD: f32 = 0.01;

/// Capability interface for per-frame speech classification.
///
/// Implementations must never assume frame sizes; the analyzer hands over
/// exactly one complete frame at a time.
pub trait FrameClassifier: Send + Sync {
    /// Classify one complete frame of canonical PCM samples as speech or
    /// non-speech. Errors are treated as "not speech" by the analyzer.
    fn classify(&self, frame: &[i16]) -> Result<bool>;
}

/// Real signal-based detector: a frame is speech when its RMS energy clears
/// a fixed floor.
#[derive(Debug, Default)]
pub struct EnergyFrameClassifier;

impl FrameClassifier for EnergyFrameClassifier {
    fn classify(&self, frame: &[i16]) -> Result<bool> {
        if frame.is_empty() {
            return Ok(false);
        }

        let sum_sq: f64 = frame
            .iter()
            .map(|&s| {
                let x = s as f64 / 32768.0;
                x * x
            })
            .sum();
        let rms = (sum_sq / frame.len() as f64).sqrt() as f32;

        Ok(rms >= FRAME_ENERGY_THRESHOLD)
    }
}

/// Fallback classifier that always reports "not speech".
#[derive(Debug, Default)]
pub struct NoopFrameClassifier;

impl FrameClassifier for NoopFrameClassifier {
    fn classify(&self, _frame: &[i16]) -> Result<bool> {
        Ok(false)
    }
}

/// Speech-ratio analyzer over the trailing window of a PCM buffer.
pub struct VadAnalyzer {
    classifier: Box<dyn FrameClassifier>,
    frame_ms: u32,
    window_ms: u32,
    pause_threshold: f32,
}

impl VadAnalyzer {
    /// Select the classifier once at session start based on configuration.
    pub fn from_config(config: &StreamingConfig) -> Self {
        if config.vad_enabled {
            Self::new(
                Box::new(EnergyFrameClassifier),
                config.vad_frame_ms,
                config.vad_window_ms,
                config.speech_ratio_threshold,
            )
        } else {
            Self::new(
                Box::new(NoopFrameClassifier),
                config.vad_frame_ms,
                config.vad_window_ms,
                FALLBACK_PAUSE_THRESHOLD,
            )
        }
    }

    pub fn new(
        classifier: Box<dyn FrameClassifier>,
        frame_ms: u32,
        window_ms: u32,
        pause_threshold: f32,
    ) -> Self {
        Self {
            classifier,
            frame_ms,
            window_ms,
            pause_threshold,
        }
    }

    /// Length in bytes of the trailing window this analyzer evaluates.
    pub fn window_bytes(&self) -> usize {
        (self.window_ms as usize * BYTES_PER_SEC) / 1000
    }

    /// Speech ratio below this value counts as a detected pause.
    pub fn pause_threshold(&self) -> f32 {
        self.pause_threshold
    }

    /// Fraction of complete frames in `tail` classified as speech, in
    /// `[0, 1]`.
    ///
    /// Empty input yields 0. A partial trailing frame is discarded rather
    /// than zero-padded. Classifier failures count the frame as non-speech.
    pub fn speech_ratio(&self, tail: &[u8]) -> f32 {
        if tail.is_empty() {
            return 0.0;
        }

        let bytes_per_frame = (self.frame_ms as usize * BYTES_PER_SEC) / 1000;
        if bytes_per_frame == 0 {
            return 0.0;
        }

        let mut speech = 0u32;
        let mut total = 0u32;

        for frame_bytes in tail.chunks_exact(bytes_per_frame) {
            let mut frame = vec![0i16; bytes_per_frame / SAMPLE_WIDTH];
            LittleEndian::read_i16_into(frame_bytes, &mut frame);

            if self.classifier.classify(&frame).unwrap_or(false) {
                speech += 1;
            }
            total += 1;
        }

        if total == 0 {
            0.0
        } else {
            speech as f32 / total as f32
        }
    }
}
