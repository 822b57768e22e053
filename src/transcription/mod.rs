//! # Transcription Module
//!
//! Speech recognition behind a capability trait. The streaming core and the
//! one-shot path only depend on `Transcriber`; the default implementation is
//! Whisper via Candle with per-size lazily-cached engines.

pub mod engine;
pub mod model;

pub use engine::WhisperTranscriber;
pub use model::{
    FakeTranscriber, ModelSize, Transcriber, TranscriptOutput, TranscriptSegment,
};
