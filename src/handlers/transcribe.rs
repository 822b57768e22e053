//! # One-Shot Transcription Endpoint
//!
//! `POST /transcribe` accepts either a multipart file upload or a JSON
//! `{"url": ...}` body, normalizes the audio to canonical PCM, and runs a
//! single recognition pass. No streaming state is involved: validate →
//! decode → invoke.
//!
//! ## Limits:
//! - Payload size is capped by `limits.max_file_mb` (413 on breach)
//! - Audio duration is capped by `limits.max_duration_sec` (413)
//! - Unsupported formats are rejected with 400, failed decodes with 422

use crate::audio::normalize;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::{ModelSize, Transcriber, TranscriptOutput, TranscriptSegment};
use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// JSON body for URL-based transcription.
#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    pub url: String,
    pub language: Option<String>,
    pub model_size: Option<String>,
    pub word_timestamps: Option<bool>,
}

/// Query parameters accepted by both input modes.
#[derive(Debug, Default, Deserialize)]
pub struct TranscribeQuery {
    pub language: Option<String>,
    pub model_size: Option<String>,
    pub word_timestamps: Option<bool>,
}

/// Response shape for the one-shot path.
#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub text: String,
    pub language: Option<String>,
    pub duration_sec: Option<f64>,
    pub segments: Vec<TranscriptSegment>,
    pub model: String,
}

/// Resolved recognition parameters after query/body/config fallbacks.
#[derive(Debug)]
struct ResolvedParams {
    language: Option<String>,
    model_size: ModelSize,
    word_timestamps: bool,
}

/// `POST /transcribe`: multipart file or JSON `{url}`.
pub async fn transcribe(
    req: HttpRequest,
    payload: web::Payload,
    query: web::Query<TranscribeQuery>,
    state: web::Data<AppState>,
    transcriber: web::Data<dyn Transcriber>,
) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let max_bytes = config.limits.max_file_mb * 1024 * 1024;

    let content_type = req
        .headers()
        .get(actix_web::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (stored, original_name, body_params) = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::new(req.headers(), payload);
        let (path, name) = store_multipart_file(multipart, max_bytes).await?;
        (path, name, None)
    } else if content_type.starts_with("application/json") {
        let url_req = read_json_body(payload).await?;
        let name = original_name_from_url(&url_req.url);
        let path = download_url(&url_req.url, max_bytes).await?;
        (path, name, Some(url_req))
    } else {
        return Err(AppError::BadRequest(
            "Provide either a multipart file or a JSON {url} body.".to_string(),
        ));
    };

    let params = resolve_params(&query, body_params.as_ref(), &config.models.model_size)?;

    info!(
        model = %params.model_size,
        language = params.language.as_deref().unwrap_or("auto"),
        "One-shot transcription requested"
    );

    let result = transcribe_stored_file(
        &stored,
        original_name.as_deref(),
        params,
        config.limits.max_duration_sec,
        transcriber.into_inner(),
    )
    .await;

    let _ = tokio::fs::remove_file(&stored).await;

    let response = result?;
    Ok(HttpResponse::Ok().json(response))
}

/// Validate, normalize and recognize one stored upload.
async fn transcribe_stored_file(
    path: &Path,
    original_name: Option<&str>,
    params: ResolvedParams,
    max_duration_sec: u64,
    transcriber: Arc<dyn Transcriber>,
) -> AppResult<TranscribeResponse> {
    let format = normalize::validate_format(path, original_name)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    debug!(format = %format, "Upload format validated");

    let (wav_path, duration) = normalize::normalize_to_wav_16k_mono(path)
        .await
        .map_err(|e| AppError::Unprocessable(format!("Audio decode/normalize failed: {}", e)))?;

    if duration > max_duration_sec as f64 {
        let _ = tokio::fs::remove_file(&wav_path).await;
        return Err(AppError::PayloadTooLarge(format!(
            "Audio duration {:.1}s exceeds limit {}s",
            duration, max_duration_sec
        )));
    }

    let ResolvedParams {
        language,
        model_size,
        word_timestamps,
    } = params;

    let wav_for_block = wav_path.clone();
    let block_result = web::block(move || -> anyhow::Result<TranscriptOutput> {
        let samples = read_wav_samples(&wav_for_block)?;
        transcriber.transcribe_samples(&samples, language.as_deref(), model_size, word_timestamps)
    })
    .await;

    let _ = tokio::fs::remove_file(&wav_path).await;

    let output = block_result
        .map_err(|e| AppError::Internal(format!("recognition worker failed: {}", e)))?
        .map_err(|e| AppError::Internal(e.to_string()))?;

    info!(
        chars = output.text.len(),
        detected_language = output.language.as_deref().unwrap_or("unknown"),
        "One-shot transcription complete"
    );

    Ok(TranscribeResponse {
        text: output.text,
        language: output.language,
        duration_sec: Some(duration),
        segments: output.segments,
        model: output.model_label,
    })
}

/// Normalized-WAV reader for the blocking pool.
fn read_wav_samples(path: &Path) -> anyhow::Result<Vec<f32>> {
    let mut file = std::fs::File::open(path)?;
    let (_header, data) = wav::read(&mut file)?;

    match data {
        wav::BitDepth::Sixteen(samples) => Ok(samples
            .iter()
            .map(|&s| s as f32 / 32768.0)
            .collect()),
        wav::BitDepth::ThirtyTwoFloat(samples) => Ok(samples),
        other => anyhow::bail!("unexpected WAV sample format: {:?}", other),
    }
}

/// Pull the uploaded file out of the multipart stream and persist it.
async fn store_multipart_file(
    mut multipart: Multipart,
    max_bytes: u64,
) -> AppResult<(PathBuf, Option<String>)> {
    while let Some(item) = multipart.next().await {
        let mut field =
            item.map_err(|e| AppError::BadRequest(format!("Invalid multipart payload: {}", e)))?;

        let disposition = field.content_disposition();
        let field_name = disposition
            .and_then(|cd| cd.get_name())
            .map(|s| s.to_string());
        let filename = disposition
            .and_then(|cd| cd.get_filename())
            .map(|s| s.to_string());

        // The upload arrives in the "file" part; other parts (or parts
        // without a filename) are skipped.
        if field_name.as_deref() != Some("file") && filename.is_none() {
            continue;
        }

        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk
                .map_err(|e| AppError::BadRequest(format!("Upload stream error: {}", e)))?;

            if (bytes.len() + chunk.len()) as u64 > max_bytes {
                return Err(file_too_large(max_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
        }

        debug!(
            size_mb = bytes.len() as f64 / (1024.0 * 1024.0),
            filename = filename.as_deref().unwrap_or("<unnamed>"),
            "Upload received"
        );

        let path = temp_upload_path();
        tokio::fs::write(&path, &bytes).await?;
        return Ok((path, filename));
    }

    Err(AppError::BadRequest(
        "Multipart body contains no file field".to_string(),
    ))
}

/// Download the referenced audio into a temp file, enforcing the size cap.
async fn download_url(url: &str, max_bytes: u64) -> AppResult<PathBuf> {
    debug!(url = %url, "Downloading audio from URL");

    let response = reqwest::get(url)
        .await
        .map_err(|e| AppError::Unprocessable(format!("Failed to download URL: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::Unprocessable(format!(
            "Failed to download URL: server returned {}",
            response.status()
        )));
    }

    let data = response
        .bytes()
        .await
        .map_err(|e| AppError::Unprocessable(format!("Failed to download URL: {}", e)))?;

    if data.len() as u64 > max_bytes {
        return Err(file_too_large(max_bytes));
    }

    let path = temp_upload_path();
    tokio::fs::write(&path, &data).await?;
    Ok(path)
}

async fn read_json_body(mut payload: web::Payload) -> AppResult<UrlRequest> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Body read error: {}", e)))?;
        body.extend_from_slice(&chunk);
    }

    if body.is_empty() {
        return Err(AppError::BadRequest(
            "Provide either a multipart file or a JSON {url} body.".to_string(),
        ));
    }

    Ok(serde_json::from_slice(&body)?)
}

/// Query parameters win over the JSON body; the configured default model
/// size backs both.
fn resolve_params(
    query: &TranscribeQuery,
    body: Option<&UrlRequest>,
    default_model_size: &str,
) -> AppResult<ResolvedParams> {
    let language = query
        .language
        .clone()
        .or_else(|| body.and_then(|b| b.language.clone()));

    let raw_size = query
        .model_size
        .clone()
        .or_else(|| body.and_then(|b| b.model_size.clone()))
        .unwrap_or_else(|| default_model_size.to_string());

    let model_size = raw_size
        .parse()
        .map_err(|_| AppError::Validation(format!("Invalid model size: {}", raw_size)))?;

    let word_timestamps = query
        .word_timestamps
        .or_else(|| body.and_then(|b| b.word_timestamps))
        .unwrap_or(false);

    Ok(ResolvedParams {
        language,
        model_size,
        word_timestamps,
    })
}

fn original_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.split(['?', '#']).next().unwrap_or("");
    let name = trimmed.rsplit('/').next().unwrap_or("");
    (!name.is_empty() && name.contains('.')).then(|| name.to_string())
}

fn temp_upload_path() -> PathBuf {
    std::env::temp_dir().join(format!("stt-upload-{}", Uuid::new_v4()))
}

fn file_too_large(max_bytes: u64) -> AppError {
    AppError::PayloadTooLarge(format!(
        "File too large (max: {} MB)",
        max_bytes / (1024 * 1024)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(model_size: Option<&str>) -> TranscribeQuery {
        TranscribeQuery {
            language: None,
            model_size: model_size.map(|s| s.to_string()),
            word_timestamps: None,
        }
    }

    #[test]
    fn test_resolve_params_fallback_chain() {
        // Query beats body beats config default.
        let body = UrlRequest {
            url: "https://example.test/a.mp3".into(),
            language: Some("es".into()),
            model_size: Some("base".into()),
            word_timestamps: Some(true),
        };

        let params = resolve_params(&query(Some("tiny")), Some(&body), "small").unwrap();
        assert_eq!(params.model_size, ModelSize::Tiny);
        assert_eq!(params.language.as_deref(), Some("es"));
        assert!(params.word_timestamps);

        let params = resolve_params(&query(None), Some(&body), "small").unwrap();
        assert_eq!(params.model_size, ModelSize::Base);

        let params = resolve_params(&query(None), None, "small").unwrap();
        assert_eq!(params.model_size, ModelSize::Small);
        assert!(!params.word_timestamps);
    }

    #[test]
    fn test_resolve_params_rejects_unknown_size() {
        let err = resolve_params(&query(Some("gigantic")), None, "small").unwrap_err();
        assert!(err.to_string().contains("Invalid model size"));
    }

    #[test]
    fn test_large_is_allowed_on_one_shot_path() {
        // The streaming allow-list does not constrain uploads.
        let params = resolve_params(&query(Some("large")), None, "small").unwrap();
        assert_eq!(params.model_size, ModelSize::Large);
    }

    #[test]
    fn test_original_name_from_url() {
        assert_eq!(
            original_name_from_url("https://x.test/audio/clip.webm?sig=abc"),
            Some("clip.webm".to_string())
        );
        assert_eq!(original_name_from_url("https://x.test/audio/"), None);
        assert_eq!(original_name_from_url("https://x.test/noext"), None);
    }
}
