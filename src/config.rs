//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Built-in defaults
//! - TOML configuration file (`config.toml`)
//! - Environment variables (`APP_` prefix)
//! - `HOST`/`PORT` overrides used by deployment platforms
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`/`PORT` environment variables
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Defaults defined in the `Default` impl

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub limits: LimitsConfig,
    pub streaming: StreamingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Recognition model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Default Whisper model size ("tiny", "base", "small", "medium", "large")
    pub model_size: String,

    /// Language hint passed to the recognizer; `None` lets it decide
    pub language: Option<String>,
}

/// Upload/download limits for the one-shot transcription path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_file_mb: u64,
    pub max_duration_sec: u64,
}

/// Streaming session tuning.
///
/// Derived byte sizes (`chunk_bytes` etc.) are computed once per session from
/// these time-domain values and the canonical byte rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Target window length submitted to the recognizer
    pub chunk_sec: f64,

    /// Minimum un-transcribed audio before a window is considered at all
    pub min_chunk_sec: f64,

    /// Look-back re-included at the head of the next window
    pub overlap_sec: f64,

    /// RMS floor below which a window is treated as silence
    pub silence_rms: f32,

    /// Whether the real frame classifier is used for pause detection
    pub vad_enabled: bool,

    /// VAD frame granularity
    pub vad_frame_ms: u32,

    /// Trailing window evaluated for the speech ratio
    pub vad_window_ms: u32,

    /// Speech ratio below which a pause is assumed (real classifier only)
    pub speech_ratio_threshold: f32,

    /// Wait after end-of-stream for trailing decoded audio before the final
    /// forced extraction
    pub finalize_grace_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                model_size: "small".to_string(),
                language: None,
            },
            limits: LimitsConfig {
                max_file_mb: 100,
                max_duration_sec: 3600,
            },
            streaming: StreamingConfig {
                chunk_sec: 2.5,
                min_chunk_sec: 1.0,
                overlap_sec: 0.5,
                silence_rms: 0.005,
                vad_enabled: true,
                vad_frame_ms: 20,
                vad_window_ms: 400,
                speech_ratio_threshold: 0.35,
                finalize_grace_ms: 150,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the configuration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self
            .models
            .model_size
            .parse::<crate::transcription::ModelSize>()
            .is_err()
        {
            return Err(anyhow::anyhow!(
                "Unknown default model size: {}",
                self.models.model_size
            ));
        }

        if self.limits.max_file_mb == 0 {
            return Err(anyhow::anyhow!("max_file_mb must be greater than 0"));
        }

        let s = &self.streaming;
        if s.chunk_sec <= 0.0 {
            return Err(anyhow::anyhow!("chunk_sec must be positive"));
        }
        if s.min_chunk_sec <= 0.0 || s.min_chunk_sec > s.chunk_sec {
            return Err(anyhow::anyhow!(
                "min_chunk_sec must be in (0, chunk_sec]"
            ));
        }
        if s.overlap_sec < 0.0 || s.overlap_sec >= s.chunk_sec {
            return Err(anyhow::anyhow!("overlap_sec must be in [0, chunk_sec)"));
        }
        if s.vad_frame_ms == 0 || s.vad_window_ms == 0 {
            return Err(anyhow::anyhow!("VAD frame and window must be non-zero"));
        }

        Ok(())
    }

    /// Apply a partial JSON update (runtime `PUT /config`).
    ///
    /// Only the fields present in the JSON are touched; the result is
    /// re-validated before being accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(models) = partial.get("models") {
            if let Some(size) = models.get("model_size").and_then(|v| v.as_str()) {
                self.models.model_size = size.to_string();
            }
            if let Some(lang) = models.get("language") {
                self.models.language = lang.as_str().map(|s| s.to_string());
            }
        }

        if let Some(limits) = partial.get("limits") {
            if let Some(mb) = limits.get("max_file_mb").and_then(|v| v.as_u64()) {
                self.limits.max_file_mb = mb;
            }
            if let Some(sec) = limits.get("max_duration_sec").and_then(|v| v.as_u64()) {
                self.limits.max_duration_sec = sec;
            }
        }

        if let Some(streaming) = partial.get("streaming") {
            if let Some(v) = streaming.get("chunk_sec").and_then(|v| v.as_f64()) {
                self.streaming.chunk_sec = v;
            }
            if let Some(v) = streaming.get("min_chunk_sec").and_then(|v| v.as_f64()) {
                self.streaming.min_chunk_sec = v;
            }
            if let Some(v) = streaming.get("overlap_sec").and_then(|v| v.as_f64()) {
                self.streaming.overlap_sec = v;
            }
            if let Some(v) = streaming.get("silence_rms").and_then(|v| v.as_f64()) {
                self.streaming.silence_rms = v as f32;
            }
            if let Some(v) = streaming.get("vad_enabled").and_then(|v| v.as_bool()) {
                self.streaming.vad_enabled = v;
            }
            if let Some(v) = streaming
                .get("speech_ratio_threshold")
                .and_then(|v| v.as_f64())
            {
                self.streaming.speech_ratio_threshold = v as f32;
            }
            if let Some(v) = streaming
                .get("finalize_grace_ms")
                .and_then(|v| v.as_u64())
            {
                self.streaming.finalize_grace_ms = v;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.models.model_size, "small");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.model_size = "enormous".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streaming.overlap_sec = config.streaming.chunk_sec;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.streaming.min_chunk_sec = config.streaming.chunk_sec + 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "streaming": {"chunk_sec": 3.0}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.streaming.chunk_sec, 3.0);
        // Untouched fields keep their values.
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.streaming.min_chunk_sec, 1.0);
    }

    #[test]
    fn test_partial_update_rejects_invalid_result() {
        let mut config = AppConfig::default();
        let json = r#"{"models": {"model_size": "bogus"}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
