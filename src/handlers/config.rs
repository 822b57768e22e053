//! Runtime configuration endpoints: inspect the live configuration and
//! apply partial updates. Updates re-validate before being accepted.

use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "models": {
                "model_size": config.models.model_size,
                "language": config.models.language
            },
            "limits": {
                "max_file_mb": config.limits.max_file_mb,
                "max_duration_sec": config.limits.max_duration_sec
            },
            "streaming": {
                "chunk_sec": config.streaming.chunk_sec,
                "min_chunk_sec": config.streaming.min_chunk_sec,
                "overlap_sec": config.streaming.overlap_sec,
                "silence_rms": config.streaming.silence_rms,
                "vad_enabled": config.streaming.vad_enabled,
                "speech_ratio_threshold": config.streaming.speech_ratio_threshold,
                "finalize_grace_ms": config.streaming.finalize_grace_ms
            }
        }
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current = state.get_config();
    current
        .update_from_json(&json_str)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    state
        .update_config(current.clone())
        .map_err(AppError::Validation)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": { "host": current.server.host, "port": current.server.port },
            "models": {
                "model_size": current.models.model_size,
                "language": current.models.language
            },
            "limits": {
                "max_file_mb": current.limits.max_file_mb,
                "max_duration_sec": current.limits.max_duration_sec
            }
        }
    })))
}
