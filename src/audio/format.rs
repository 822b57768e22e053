//! # Stream Format Descriptor
//!
//! Describes the encoding of incoming audio and decides whether a decode
//! step is required. Everything downstream of the decode pipeline works on
//! canonical PCM: mono, 16-bit little-endian, 16 kHz.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Canonical sample rate used internally for buffering and recognition.
pub const SAMPLE_RATE: u32 = 16_000;

/// Bytes per canonical sample (16-bit PCM).
pub const SAMPLE_WIDTH: usize = 2;

/// Canonical byte rate: `SAMPLE_RATE * SAMPLE_WIDTH`.
pub const BYTES_PER_SEC: usize = SAMPLE_RATE as usize * SAMPLE_WIDTH;

/// Container/codec formats accepted over the streaming handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Wav,
    Mp3,
    M4a,
    Ogg,
    Webm,
    Flac,
    /// Raw 16-bit little-endian PCM
    S16le,
    /// Raw 32-bit float little-endian PCM
    F32le,
}

/// Container formats listed in handshake error messages (raw tags excluded,
/// matching the wire protocol's documented set).
pub const SUPPORTED_CONTAINER_FORMATS: &[&str] = &["wav", "mp3", "m4a", "ogg", "webm", "flac"];

impl StreamFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::Wav => "wav",
            StreamFormat::Mp3 => "mp3",
            StreamFormat::M4a => "m4a",
            StreamFormat::Ogg => "ogg",
            StreamFormat::Webm => "webm",
            StreamFormat::Flac => "flac",
            StreamFormat::S16le => "s16le",
            StreamFormat::F32le => "f32le",
        }
    }
}

impl std::str::FromStr for StreamFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // Alias normalization happens before matching ("mp4" is the common
        // alternate name for the m4a container).
        let normalized = match s.to_lowercase().as_str() {
            "mp4" => "m4a".to_string(),
            other => other.to_string(),
        };

        match normalized.as_str() {
            "wav" => Ok(StreamFormat::Wav),
            "mp3" => Ok(StreamFormat::Mp3),
            "m4a" => Ok(StreamFormat::M4a),
            "ogg" => Ok(StreamFormat::Ogg),
            "webm" => Ok(StreamFormat::Webm),
            "flac" => Ok(StreamFormat::Flac),
            "s16le" => Ok(StreamFormat::S16le),
            "f32le" => Ok(StreamFormat::F32le),
            _ => Err(anyhow!(
                "Unsupported format '{}'. Supported formats: {}",
                s,
                SUPPORTED_CONTAINER_FORMATS.join(", ")
            )),
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable description of the incoming audio encoding for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub format: StreamFormat,
    pub sample_rate: u32,
}

impl AudioFormat {
    /// Build a descriptor; a missing or zero rate falls back to the
    /// canonical rate.
    pub fn new(format: StreamFormat, sample_rate: Option<u32>) -> Self {
        Self {
            format,
            sample_rate: sample_rate.filter(|r| *r > 0).unwrap_or(SAMPLE_RATE),
        }
    }

    /// A decode step is needed unless the stream already is canonical PCM at
    /// the canonical rate.
    pub fn needs_conversion(&self) -> bool {
        !(self.format == StreamFormat::S16le && self.sample_rate == SAMPLE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_formats() {
        assert_eq!("webm".parse::<StreamFormat>().unwrap(), StreamFormat::Webm);
        assert_eq!("S16LE".parse::<StreamFormat>().unwrap(), StreamFormat::S16le);
    }

    #[test]
    fn test_mp4_alias_normalizes_to_m4a() {
        assert_eq!("mp4".parse::<StreamFormat>().unwrap(), StreamFormat::M4a);
        assert_eq!("MP4".parse::<StreamFormat>().unwrap(), StreamFormat::M4a);
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        let err = "aiff".parse::<StreamFormat>().unwrap_err();
        assert!(err.to_string().contains("Unsupported format"));
    }

    #[test]
    fn test_conversion_truth_table() {
        // Canonical PCM at the canonical rate is the only combination that
        // skips the decode pipeline.
        let direct = AudioFormat::new(StreamFormat::S16le, Some(SAMPLE_RATE));
        assert!(!direct.needs_conversion());

        let resample = AudioFormat::new(StreamFormat::S16le, Some(48_000));
        assert!(resample.needs_conversion());

        let float = AudioFormat::new(StreamFormat::F32le, Some(SAMPLE_RATE));
        assert!(float.needs_conversion());

        let container = AudioFormat::new(StreamFormat::Webm, None);
        assert!(container.needs_conversion());
    }

    #[test]
    fn test_missing_rate_defaults_to_canonical() {
        let fmt = AudioFormat::new(StreamFormat::S16le, None);
        assert_eq!(fmt.sample_rate, SAMPLE_RATE);
        assert!(!fmt.needs_conversion());

        let zero = AudioFormat::new(StreamFormat::S16le, Some(0));
        assert_eq!(zero.sample_rate, SAMPLE_RATE);
    }
}
