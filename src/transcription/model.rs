//! # Recognition Engine Boundary
//!
//! Types and the capability trait at the seam between the streaming core and
//! the speech recognizer. The core only ever sees `Transcriber`; the candle
//! implementation lives in `engine.rs` and a fixed-output double backs the
//! tests.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Available Whisper model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace repository for this size.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Sizes a streaming handshake may request. `large` stays reserved for
    /// the one-shot path where latency does not compound per chunk.
    pub fn allowed_for_streaming(&self) -> bool {
        !matches!(self, ModelSize::Large)
    }

    /// The allow-list spelled out for handshake error messages.
    pub fn streaming_allow_list() -> &'static str {
        "tiny, base, small, medium"
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// One timed piece of recognized text. Times are in seconds relative to the
/// submitted window, not the whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Result of one recognition pass.
#[derive(Debug, Clone)]
pub struct TranscriptOutput {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<TranscriptSegment>,
    pub model_label: String,
}

/// Capability interface consumed by the dispatcher and the one-shot path.
///
/// Implementations are synchronous; every call site dispatches through the
/// blocking pool (`tokio::task::spawn_blocking`), so a slow recognition pass
/// never stalls frame ingestion. Implementations must tolerate being invoked
/// many times per session with different `model_size` values.
pub trait Transcriber: Send + Sync {
    fn transcribe_samples(
        &self,
        samples: &[f32],
        language: Option<&str>,
        model_size: ModelSize,
        word_timestamps: bool,
    ) -> Result<TranscriptOutput>;
}

/// Fixed-output recognizer used in tests so nothing downloads real models.
pub struct FakeTranscriber {
    text: String,
}

impl FakeTranscriber {
    pub fn new() -> Self {
        Self {
            text: "hello world".to_string(),
        }
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for FakeTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcriber for FakeTranscriber {
    fn transcribe_samples(
        &self,
        _samples: &[f32],
        language: Option<&str>,
        model_size: ModelSize,
        _word_timestamps: bool,
    ) -> Result<TranscriptOutput> {
        let segments = if self.text.trim().is_empty() {
            Vec::new()
        } else {
            vec![TranscriptSegment {
                start: 0.0,
                end: 1.0,
                text: self.text.clone(),
            }]
        };

        Ok(TranscriptOutput {
            text: self.text.clone(),
            language: Some(language.unwrap_or("en").to_string()),
            segments,
            model_label: format!("fake:{}", model_size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!("huge".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_streaming_allow_list_excludes_large() {
        for size in [
            ModelSize::Tiny,
            ModelSize::Base,
            ModelSize::Small,
            ModelSize::Medium,
        ] {
            assert!(size.allowed_for_streaming(), "{size} should stream");
        }
        assert!(!ModelSize::Large.allowed_for_streaming());
    }

    #[test]
    fn test_fake_transcriber_output_shape() {
        let fake = FakeTranscriber::new();
        let out = fake
            .transcribe_samples(&[0.0; 16_000], None, ModelSize::Small, false)
            .unwrap();

        assert_eq!(out.text, "hello world");
        assert_eq!(out.model_label, "fake:small");
        assert_eq!(out.segments.len(), 1);
        assert_eq!(out.segments[0].start, 0.0);
        assert_eq!(out.segments[0].end, 1.0);
    }

    #[test]
    fn test_segment_serializes_with_wire_field_names() {
        let seg = TranscriptSegment {
            start: 0.5,
            end: 1.25,
            text: "hi".into(),
        };
        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json["start"], 0.5);
        assert_eq!(json["end"], 1.25);
        assert_eq!(json["text"], "hi");
    }
}
