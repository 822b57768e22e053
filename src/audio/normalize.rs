//! # One-Shot Audio Normalization
//!
//! Whole-file helpers for the upload/URL transcription path: probe the
//! container format, convert to canonical 16 kHz mono WAV with FFmpeg, and
//! measure duration with ffprobe. The streaming path never uses these — it
//! has its own incremental pipeline in `decoder.rs`.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Upload formats accepted by the one-shot path.
pub const SUPPORTED_UPLOAD_FORMATS: &[&str] = &["wav", "mp3", "m4a", "ogg", "webm", "flac"];

/// Verify FFmpeg is callable before doing any work.
pub async fn ensure_ffmpeg() -> Result<()> {
    let status = Command::new("ffmpeg")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .context("ffmpeg not found in PATH")?;

    if !status.success() {
        return Err(anyhow!("ffmpeg -version exited with {}", status));
    }
    Ok(())
}

/// Determine the upload's format, by content first and filename second.
///
/// ffprobe reports comma-separated candidates; each is mapped through the
/// container aliases and checked against the supported set. When probing
/// fails entirely, the filename extension (of the stored path or the
/// client-provided name) is the fallback.
pub async fn validate_format(path: &Path, original_name: Option<&str>) -> Result<String> {
    for candidate in probe_format(path).await {
        let normalized = map_probe_name(&candidate);
        if SUPPORTED_UPLOAD_FORMATS.contains(&normalized.as_str()) {
            debug!(format = %normalized, path = %path.display(), "Detected upload format");
            return Ok(normalized);
        }
    }

    for hint in [path.to_str(), original_name].into_iter().flatten() {
        let ext = extract_extension(hint);
        if SUPPORTED_UPLOAD_FORMATS.contains(&ext.as_str()) {
            debug!(format = %ext, hint = %hint, "Upload format from filename extension");
            return Ok(ext);
        }
    }

    Err(anyhow!(
        "Unsupported audio format. Supported formats: {}.",
        SUPPORTED_UPLOAD_FORMATS.join(", ")
    ))
}

/// Convert any supported input to canonical 16 kHz mono WAV.
///
/// Returns the output path and the measured duration in seconds. The caller
/// owns both temp files and is responsible for removal.
pub async fn normalize_to_wav_16k_mono(input: &Path) -> Result<(PathBuf, f64)> {
    ensure_ffmpeg().await?;

    let output = std::env::temp_dir().join(format!("stt-norm-{}.wav", uuid::Uuid::new_v4()));

    let status = Command::new("ffmpeg")
        .args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
        .arg(input)
        .args(["-ac", "1", "-ar", "16000", "-f", "wav"])
        .arg(&output)
        .status()
        .await
        .context("failed to run ffmpeg")?;

    if !status.success() {
        let _ = tokio::fs::remove_file(&output).await;
        return Err(anyhow!("ffmpeg normalization exited with {}", status));
    }

    let duration = probe_duration(&output).await?;
    Ok((output, duration))
}

/// Container duration in seconds via ffprobe.
pub async fn probe_duration(path: &Path) -> Result<f64> {
    let out = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .context("failed to run ffprobe")?;

    if !out.status.success() {
        return Err(anyhow!("ffprobe exited with {}", out.status));
    }

    String::from_utf8_lossy(&out.stdout)
        .trim()
        .parse::<f64>()
        .context("ffprobe returned a non-numeric duration")
}

/// Format-name candidates reported by ffprobe, lowercased. Empty on probe
/// failure — the caller falls back to filename extensions.
async fn probe_format(path: &Path) -> Vec<String> {
    let out = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=format_name",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await;

    let out = match out {
        Ok(out) if out.status.success() => out,
        Ok(out) => {
            warn!(path = %path.display(), status = %out.status, "ffprobe format detection failed");
            return Vec::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ffprobe not runnable");
            return Vec::new();
        }
    };

    String::from_utf8_lossy(&out.stdout)
        .trim()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Aliases ffprobe commonly reports for m4a and webm containers.
fn map_probe_name(name: &str) -> String {
    match name.trim().to_lowercase().as_str() {
        "mov" | "mp4" | "m4a" => "m4a".to_string(),
        "matroska" => "webm".to_string(),
        other => other.to_string(),
    }
}

/// Lowercased filename extension with any URL query/fragment stripped.
fn extract_extension(name: &str) -> String {
    let cleaned = name
        .split('?')
        .next()
        .unwrap_or("")
        .split('#')
        .next()
        .unwrap_or("");

    Path::new(cleaned)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_alias_mapping() {
        assert_eq!(map_probe_name("mov"), "m4a");
        assert_eq!(map_probe_name("MP4"), "m4a");
        assert_eq!(map_probe_name("matroska"), "webm");
        assert_eq!(map_probe_name("ogg"), "ogg");
    }

    #[test]
    fn test_extension_extraction() {
        assert_eq!(extract_extension("talk.MP3"), "mp3");
        assert_eq!(extract_extension("https://x.test/a/clip.webm?sig=1#t=2"), "webm");
        assert_eq!(extract_extension("no_extension"), "");
    }

    #[tokio::test]
    async fn test_unprobeable_file_falls_back_to_name_then_fails() {
        let tmp = std::env::temp_dir().join(format!("stt-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, b"not audio at all").await.unwrap();

        // A usable extension on the client-provided name is accepted even
        // when probing finds nothing.
        let format = validate_format(&tmp, Some("voice-memo.ogg")).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match format {
            Ok(f) => assert_eq!(f, "ogg"),
            // Environments where ffprobe identifies even garbage would take
            // the probe path instead; both outcomes name a supported format
            // or fail with the supported list.
            Err(e) => assert!(e.to_string().contains("Supported formats")),
        }
    }
}
