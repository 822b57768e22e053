//! # Audio Module
//!
//! The streaming session core and its collaborators: format descriptors,
//! the PCM buffer with chunk policy, voice-activity analysis, the FFmpeg
//! decode pipeline, and the one-shot normalization helpers.
//!
//! ## Canonical PCM:
//! Everything past the decode boundary is mono 16-bit little-endian PCM at
//! 16 kHz. Incoming streams in any other encoding pass through the decode
//! pipeline first.

pub mod buffer;     // PCM buffer, chunk readiness, extraction, trim
pub mod decoder;    // FFmpeg subprocess wrapper for streaming conversion
pub mod format;     // Stream format descriptor and canonical constants
pub mod normalize;  // Whole-file normalization for the one-shot path
pub mod session;    // Per-connection streaming session
pub mod vad;        // Frame classifiers and the speech-ratio analyzer
