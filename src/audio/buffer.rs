//! # Streaming Buffer & Chunk Policy
//!
//! Owns the growing canonical-PCM buffer for one session together with the
//! transcribed-offset cursor, and decides when a window of un-transcribed
//! audio is ready for recognition.
//!
//! ## Invariants:
//! - `0 <= transcribed <= pcm.len()` at all times
//! - The offset is monotonically non-decreasing except inside `trim()`,
//!   which shifts buffer and offset together so relative positions survive
//! - Retained history is capped at roughly two chunk-widths regardless of
//!   session duration
//!
//! ## Concurrency:
//! The decode pipeline's background reader and the session task both touch
//! the buffer, so the byte store sits behind a `Mutex`. There is exactly one
//! extracting reader per session; writers only ever append.

use crate::audio::format::BYTES_PER_SEC;
use crate::audio::vad::VadAnalyzer;
use crate::config::StreamingConfig;
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct BufferInner {
    /// Canonical mono 16-bit little-endian PCM
    pcm: Vec<u8>,

    /// Byte index marking the start of not-yet-consumed audio
    transcribed: usize,
}

/// Shared per-session PCM buffer with chunk-extraction policy.
pub struct StreamBuffer {
    inner: Mutex<BufferInner>,

    // Sizes derived once from the time-domain configuration.
    chunk_bytes: usize,
    min_chunk_bytes: usize,
    overlap_bytes: usize,

    silence_rms: f32,
}

impl StreamBuffer {
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            chunk_bytes: (config.chunk_sec * BYTES_PER_SEC as f64) as usize,
            min_chunk_bytes: (config.min_chunk_sec * BYTES_PER_SEC as f64) as usize,
            overlap_bytes: (config.overlap_sec * BYTES_PER_SEC as f64) as usize,
            silence_rms: config.silence_rms,
        }
    }

    /// Append decoded or direct PCM bytes. This is the only growth path.
    pub fn append(&self, data: &[u8]) {
        self.inner.lock().unwrap().pcm.extend_from_slice(data);
    }

    /// Total buffered bytes (after trims).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pcm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current transcribed-offset cursor.
    pub fn transcribed(&self) -> usize {
        self.inner.lock().unwrap().transcribed
    }

    /// Bytes not yet consumed by an extraction.
    pub fn pending_len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.pcm.len() - inner.transcribed
    }

    /// Copy of the most recent `max_bytes` of the buffer (for VAD).
    pub fn tail(&self, max_bytes: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let start = inner.pcm.len().saturating_sub(max_bytes);
        inner.pcm[start..].to_vec()
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn overlap_bytes(&self) -> usize {
        self.overlap_bytes
    }

    /// Decide whether a recognition window is ready.
    ///
    /// ## Rule order:
    /// 1. `force` (end-of-stream): ready iff anything is pending
    /// 2. Below the minimum chunk size: not ready
    /// 3. At or past the full chunk size: ready — the hard cap that bounds
    ///    accumulation regardless of the VAD score
    /// 4. Otherwise: ready iff the speech ratio over the trailing window is
    ///    below the analyzer's pause threshold
    pub fn should_transcribe(&self, force: bool, vad: &VadAnalyzer) -> bool {
        let pending = self.pending_len();

        if force {
            return pending > 0;
        }

        if pending < self.min_chunk_bytes {
            return false;
        }

        if pending >= self.chunk_bytes {
            return true;
        }

        let ratio = vad.speech_ratio(&self.tail(vad.window_bytes()));
        ratio < vad.pause_threshold()
    }

    /// Extract the next window as normalized float samples.
    ///
    /// The window spans `[transcribed, min(transcribed + chunk_bytes, len))`.
    /// A window whose RMS falls below the silence floor yields `None`
    /// *without* advancing the offset, so a silent prefix stays eligible to
    /// merge with later audio. On success the offset advances by
    /// `window - overlap`, deliberately re-exposing the tail of this window
    /// to the next one.
    pub fn extract_chunk(&self) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock().unwrap();

        let available = inner.pcm.len() - inner.transcribed;
        if available == 0 {
            return None;
        }

        let take = self.chunk_bytes.min(available);
        let window = &inner.pcm[inner.transcribed..inner.transcribed + take];

        let samples = pcm16_to_f32(window);
        if samples.is_empty() {
            return None;
        }

        if rms(&samples) < self.silence_rms {
            return None;
        }

        let advance = take.saturating_sub(self.overlap_bytes);
        inner.transcribed += advance;

        Some(samples)
    }

    /// Drop history older than `transcribed - 2 * chunk_bytes`, shifting the
    /// buffer and the offset together so outstanding positions stay valid.
    pub fn trim(&self) {
        let mut inner = self.inner.lock().unwrap();

        let keep_after = inner.transcribed.saturating_sub(2 * self.chunk_bytes);
        if keep_after > 0 {
            inner.pcm.drain(..keep_after);
            inner.transcribed -= keep_after;
        }
    }
}

/// 16-bit little-endian PCM to normalized `[-1, 1]` floats. A trailing odd
/// byte (half a sample) is ignored.
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| LittleEndian::read_i16(pair) as f32 / 32768.0)
        .collect()
}

/// Root-mean-square energy of normalized samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::vad::{NoopFrameClassifier, VadAnalyzer, FALLBACK_PAUSE_THRESHOLD};
    use crate::config::AppConfig;

    fn test_buffer() -> StreamBuffer {
        StreamBuffer::new(&AppConfig::default().streaming)
    }

    fn noop_vad() -> VadAnalyzer {
        VadAnalyzer::new(
            Box::new(NoopFrameClassifier),
            20,
            400,
            FALLBACK_PAUSE_THRESHOLD,
        )
    }

    /// Non-silent PCM with enough variation that every window clears the
    /// silence gate and samples differ position to position.
    fn voiced_pcm(bytes: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes);
        let mut i: i32 = 0;
        while out.len() < bytes {
            let sample = (((i % 200) - 100) * 120) as i16;
            out.extend_from_slice(&sample.to_le_bytes());
            i += 1;
        }
        out
    }

    #[test]
    fn test_force_readiness_requires_pending_audio() {
        let buffer = test_buffer();
        let vad = noop_vad();

        assert!(!buffer.should_transcribe(true, &vad));

        buffer.append(&[0u8, 0u8]);
        assert!(buffer.should_transcribe(true, &vad));
    }

    #[test]
    fn test_min_chunk_gate() {
        let buffer = test_buffer();
        let vad = noop_vad();

        // Half the minimum chunk: not ready without force.
        buffer.append(&voiced_pcm(buffer.min_chunk_bytes / 2));
        assert!(!buffer.should_transcribe(false, &vad));
        assert!(buffer.should_transcribe(true, &vad));
    }

    #[test]
    fn test_full_chunk_is_hard_cap() {
        let buffer = test_buffer();
        // Noop VAD never signals a pause, so only the hard cap can trigger.
        let vad = noop_vad();

        buffer.append(&voiced_pcm(buffer.chunk_bytes()));
        assert!(buffer.should_transcribe(false, &vad));
    }

    #[test]
    fn test_between_min_and_chunk_noop_vad_never_fires() {
        let buffer = test_buffer();
        let vad = noop_vad();

        // Pending length sits between min and full chunk; with the fallback
        // classifier the pause branch must stay closed.
        buffer.append(&voiced_pcm((buffer.min_chunk_bytes + buffer.chunk_bytes) / 2));
        assert!(!buffer.should_transcribe(false, &vad));
    }

    #[test]
    fn test_between_min_and_chunk_real_pause_fires() {
        let buffer = test_buffer();
        let vad = VadAnalyzer::from_config(&AppConfig::default().streaming);

        // Voiced audio followed by a silent tail longer than the VAD window:
        // the trailing ratio drops to zero and the pause branch opens.
        let voiced = voiced_pcm(buffer.min_chunk_bytes);
        buffer.append(&voiced);
        buffer.append(&vec![12u8, 0u8].repeat(8_000)); // quiet but not dead
        assert!(buffer.pending_len() < buffer.chunk_bytes());
        assert!(buffer.should_transcribe(false, &vad));
    }

    #[test]
    fn test_between_min_and_chunk_ongoing_speech_waits() {
        let buffer = test_buffer();
        let vad = VadAnalyzer::from_config(&AppConfig::default().streaming);

        // Loud audio all the way to the end: no pause, so readiness waits
        // for the full chunk.
        buffer.append(&voiced_pcm((buffer.min_chunk_bytes + buffer.chunk_bytes) / 2));
        assert!(!buffer.should_transcribe(false, &vad));
    }

    #[test]
    fn test_offset_monotonic_and_trim_preserves_relative_position() {
        let buffer = test_buffer();

        buffer.append(&voiced_pcm(buffer.chunk_bytes() * 5));

        let mut last_offset = 0;
        for _ in 0..3 {
            assert!(buffer.extract_chunk().is_some());
            let offset = buffer.transcribed();
            assert!(offset >= last_offset);
            last_offset = offset;
        }

        let pending_before = buffer.pending_len();
        let offset_before = buffer.transcribed();
        let len_before = buffer.len();

        buffer.trim();

        // Pending audio is untouched; buffer and offset shifted together.
        assert_eq!(buffer.pending_len(), pending_before);
        let shift = offset_before - buffer.transcribed();
        assert_eq!(len_before - buffer.len(), shift);
        assert!(buffer.transcribed() >= buffer.chunk_bytes() * 2 - buffer.overlap_bytes());
    }

    #[test]
    fn test_trim_caps_history_to_two_chunks() {
        let buffer = test_buffer();

        for _ in 0..10 {
            buffer.append(&voiced_pcm(buffer.chunk_bytes()));
            buffer.extract_chunk();
            buffer.trim();
        }

        // History behind the cursor never exceeds two chunk-widths.
        assert!(buffer.transcribed() <= 2 * buffer.chunk_bytes());
    }

    #[test]
    fn test_silence_gate_does_not_advance_and_recovers() {
        let buffer = test_buffer();

        // A silent window: extraction declines and keeps the offset, so the
        // silent prefix stays mergeable instead of being skipped for good.
        buffer.append(&vec![0u8; buffer.chunk_bytes() / 2]);
        assert!(buffer.extract_chunk().is_none());
        assert_eq!(buffer.transcribed(), 0);

        // Voiced audio afterwards merges with the silent prefix and the
        // combined window transcribes.
        buffer.append(&voiced_pcm(buffer.chunk_bytes() / 2));
        let samples = buffer.extract_chunk().expect("combined window extracts");
        assert_eq!(samples.len() * 2, buffer.chunk_bytes());
        assert!(buffer.transcribed() > 0);
    }

    #[test]
    fn test_consecutive_extractions_overlap_exactly() {
        let buffer = test_buffer();
        buffer.append(&voiced_pcm(buffer.chunk_bytes() * 3));

        let first = buffer.extract_chunk().unwrap();
        let second = buffer.extract_chunk().unwrap();

        let overlap_samples = buffer.overlap_bytes() / 2;
        let tail = &first[first.len() - overlap_samples..];
        let head = &second[..overlap_samples];
        assert_eq!(tail, head);
    }

    #[test]
    fn test_short_final_window_extracts_whats_left() {
        let buffer = test_buffer();
        let short = buffer.min_chunk_bytes / 2;
        buffer.append(&voiced_pcm(short));

        let samples = buffer.extract_chunk().unwrap();
        assert_eq!(samples.len() * 2, short);
        // Window no longer than the overlap: the advance clamps at zero.
        assert_eq!(buffer.transcribed(), 0);
    }

    #[test]
    fn test_pcm16_to_f32_bounds() {
        let bytes: Vec<u8> = [0i16, 16384, -16384, 32767, -32768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = pcm16_to_f32(&bytes);
        assert_eq!(samples.len(), 5);
        assert!(samples.iter().all(|s| (-1.0..=1.0).contains(s)));
        assert_eq!(samples[0], 0.0);
    }
}
