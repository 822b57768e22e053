//! # Streaming Session
//!
//! Per-connection state machine core: composes the format descriptor, the
//! PCM buffer with its chunk policy, the voice-activity analyzer, the
//! optional decode pipeline, and the recognition dispatcher.
//!
//! ## Lifecycle:
//! 1. Created from a validated handshake
//! 2. `start()` launches the decode pipeline when conversion is needed
//! 3. Every audio payload runs one ingest → readiness → dispatch cycle
//! 4. `finalize()` drains the decoder and forces one last cycle
//! 5. `cleanup()` tears resources down — exactly once, idempotently
//!
//! Recognition runs on the blocking pool and is awaited before the next
//! window is considered, so invocations for one session are strictly serial.

use crate::audio::buffer::StreamBuffer;
use crate::audio::decoder::DecodePipeline;
use crate::audio::format::AudioFormat;
use crate::audio::vad::VadAnalyzer;
use crate::config::AppConfig;
use crate::transcription::{ModelSize, Transcriber, TranscriptSegment};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Incremental transcription produced by one dispatch cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptDelta {
    pub append: String,
    pub segments: Vec<TranscriptSegment>,
}

/// Streaming handshake payload.
#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(rename = "type")]
    kind: String,
    format: Option<String>,
    rate: Option<u32>,
    model_size: Option<String>,
}

/// Parse and validate the first control frame of a connection.
///
/// `fallback_model_size` comes from the connection's query string and only
/// applies when the handshake itself names no size. Returns the format
/// descriptor and an optional validated model-size override. All failures
/// are protocol errors: the caller closes the connection without allocating
/// session resources.
pub fn parse_handshake(
    message: &str,
    fallback_model_size: Option<&str>,
) -> Result<(AudioFormat, Option<ModelSize>)> {
    let start: StartMessage =
        serde_json::from_str(message).map_err(|e| anyhow!("Invalid handshake: {}", e))?;

    if start.kind != "start" {
        return Err(anyhow!("Invalid handshake type: {}", start.kind));
    }

    // Browsers most commonly ship MediaRecorder/webm, so that is the
    // default when the client names no format.
    let format_tag = start.format.as_deref().unwrap_or("webm");
    let format = format_tag.parse()?;

    let model_size = match start
        .model_size
        .as_deref()
        .or(fallback_model_size)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(raw) => {
            let size: ModelSize = raw
                .parse()
                .map_err(|_| invalid_model_size(raw))?;
            if !size.allowed_for_streaming() {
                return Err(invalid_model_size(raw));
            }
            Some(size)
        }
        None => None,
    };

    Ok((AudioFormat::new(format, start.rate), model_size))
}

fn invalid_model_size(raw: &str) -> anyhow::Error {
    anyhow!(
        "Invalid model size '{}'. Allowed sizes: {}",
        raw,
        ModelSize::streaming_allow_list()
    )
}

/// State for one streaming connection.
pub struct StreamingSession {
    id: String,
    format: AudioFormat,
    model_size: ModelSize,
    language: Option<String>,

    buffer: Arc<StreamBuffer>,
    vad: VadAnalyzer,
    pipeline: Option<DecodePipeline>,
    transcriber: Arc<dyn Transcriber>,

    finalize_grace: Duration,
    cleaned_up: bool,
}

impl StreamingSession {
    pub fn new(
        id: impl Into<String>,
        format: AudioFormat,
        model_size_override: Option<ModelSize>,
        transcriber: Arc<dyn Transcriber>,
        config: &AppConfig,
    ) -> Result<Self> {
        let id = id.into();
        let model_size = match model_size_override {
            Some(size) => size,
            None => config.models.model_size.parse()?,
        };

        let buffer = Arc::new(StreamBuffer::new(&config.streaming));
        let pipeline = format.needs_conversion().then(|| {
            DecodePipeline::new(format, Arc::clone(&buffer), id.clone())
        });

        info!(
            session_id = %id,
            format = %format.format,
            rate = format.sample_rate,
            model = %model_size,
            conversion = format.needs_conversion(),
            "Streaming session created"
        );

        Ok(Self {
            id,
            format,
            model_size,
            language: config.models.language.clone(),
            buffer,
            vad: VadAnalyzer::from_config(&config.streaming),
            pipeline,
            transcriber,
            finalize_grace: Duration::from_millis(config.streaming.finalize_grace_ms),
            cleaned_up: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Access to the shared buffer (tests and diagnostics).
    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    /// Launch the decode pipeline when the format requires one. Fatal on
    /// failure.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.start().await?;
        } else {
            debug!(session_id = %self.id, "Direct PCM mode, no decoder needed");
        }
        Ok(())
    }

    /// One full cycle: ingest the payload, check readiness, and if a window
    /// is ready run recognition and trim the buffer.
    ///
    /// Returns a delta when recognition produced non-empty text.
    pub async fn process_audio(
        &mut self,
        data: &[u8],
        force: bool,
    ) -> Result<Option<TranscriptDelta>> {
        if !data.is_empty() {
            if self.format.needs_conversion() {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.feed(data).await?;
                }
            } else {
                self.buffer.append(data);
            }
        }

        if !self.buffer.should_transcribe(force, &self.vad) {
            return Ok(None);
        }

        let samples = match self.buffer.extract_chunk() {
            Some(samples) => samples,
            None => return Ok(None),
        };

        let delta = self.dispatch(samples).await?;
        self.buffer.trim();

        Ok(delta)
    }

    /// End-of-stream: half-close the decoder, give trailing decoded audio a
    /// grace period to arrive, then force one final cycle. The minimum-size
    /// and VAD gates do not apply to the forced cycle.
    pub async fn finalize(&mut self) -> Result<Option<TranscriptDelta>> {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.close_input().await;
        }

        tokio::time::sleep(self.finalize_grace).await;

        self.process_audio(&[], true).await
    }

    /// Release the decode pipeline. Safe to call on every termination path
    /// and when no pipeline was ever started; only the first call acts.
    pub async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.stop().await;
        }

        debug!(session_id = %self.id, "Session resources released");
    }

    /// Run recognition for one window off the critical path and shape the
    /// result into a delta.
    async fn dispatch(&self, samples: Vec<f32>) -> Result<Option<TranscriptDelta>> {
        let transcriber = Arc::clone(&self.transcriber);
        let language = self.language.clone();
        let model_size = self.model_size;

        debug!(
            session_id = %self.id,
            samples = samples.len(),
            "Dispatching window to recognizer"
        );

        let output = tokio::task::spawn_blocking(move || {
            transcriber.transcribe_samples(&samples, language.as_deref(), model_size, false)
        })
        .await
        .map_err(|e| anyhow!("recognition worker failed: {}", e))??;

        let text = output.text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(TranscriptDelta {
            append: text.to_string(),
            segments: output.segments,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{StreamFormat, BYTES_PER_SEC, SAMPLE_RATE};
    use crate::transcription::FakeTranscriber;

    fn direct_format() -> AudioFormat {
        AudioFormat::new(StreamFormat::S16le, Some(SAMPLE_RATE))
    }

    fn test_session(transcriber: Arc<dyn Transcriber>) -> StreamingSession {
        StreamingSession::new(
            "test-session",
            direct_format(),
            None,
            transcriber,
            &AppConfig::default(),
        )
        .unwrap()
    }

    fn voiced_pcm(bytes: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes);
        let mut i: i32 = 0;
        while out.len() < bytes {
            let sample = (((i % 160) - 80) * 150) as i16;
            out.extend_from_slice(&sample.to_le_bytes());
            i += 1;
        }
        out
    }

    #[test]
    fn test_handshake_direct_pcm() {
        let (format, size) =
            parse_handshake(r#"{"type":"start","format":"s16le","rate":16000}"#, None).unwrap();
        assert_eq!(format.format, StreamFormat::S16le);
        assert_eq!(format.sample_rate, 16_000);
        assert!(!format.needs_conversion());
        assert!(size.is_none());
    }

    #[test]
    fn test_handshake_alias_normalizes_before_pipeline_selection() {
        let (format, _) =
            parse_handshake(r#"{"type":"start","format":"mp4"}"#, None).unwrap();
        assert_eq!(format.format, StreamFormat::M4a);
        assert!(format.needs_conversion());
    }

    #[test]
    fn test_handshake_defaults_to_webm() {
        let (format, _) = parse_handshake(r#"{"type":"start"}"#, None).unwrap();
        assert_eq!(format.format, StreamFormat::Webm);
    }

    #[test]
    fn test_handshake_rejections() {
        // Malformed JSON.
        assert!(parse_handshake("not json", None).is_err());
        // Wrong command type.
        assert!(parse_handshake(r#"{"type":"begin","format":"wav"}"#, None).is_err());
        // Unsupported format.
        assert!(parse_handshake(r#"{"type":"start","format":"aiff"}"#, None).is_err());
        // Model size outside the allow-list.
        assert!(
            parse_handshake(r#"{"type":"start","format":"wav","model_size":"large"}"#, None)
                .is_err()
        );
        assert!(
            parse_handshake(r#"{"type":"start","format":"wav","model_size":"bogus"}"#, None)
                .is_err()
        );
    }

    #[test]
    fn test_handshake_model_size_sources() {
        let (_, size) = parse_handshake(
            r#"{"type":"start","format":"wav","model_size":"tiny"}"#,
            Some("base"),
        )
        .unwrap();
        assert_eq!(size, Some(ModelSize::Tiny));

        // Query-string fallback applies when the handshake is silent.
        let (_, size) =
            parse_handshake(r#"{"type":"start","format":"wav"}"#, Some("base")).unwrap();
        assert_eq!(size, Some(ModelSize::Base));

        // The fallback is validated too.
        assert!(parse_handshake(r#"{"type":"start","format":"wav"}"#, Some("large")).is_err());
    }

    #[tokio::test]
    async fn test_exact_chunk_triggers_one_delta_and_advances_with_overlap() {
        let mut session = test_session(Arc::new(FakeTranscriber::new()));
        session.start().await.unwrap();

        let chunk_bytes = session.buffer().chunk_bytes();
        let overlap_bytes = session.buffer().overlap_bytes();

        let delta = session
            .process_audio(&voiced_pcm(chunk_bytes), false)
            .await
            .unwrap()
            .expect("full non-silent chunk produces a delta");

        assert_eq!(delta.append, "hello world");
        assert!(!delta.segments.is_empty());
        assert_eq!(session.buffer().transcribed(), chunk_bytes - overlap_bytes);
    }

    #[tokio::test]
    async fn test_small_payloads_below_minimum_emit_nothing() {
        let mut session = test_session(Arc::new(FakeTranscriber::new()));
        session.start().await.unwrap();

        // Half the minimum chunk, fed in small pieces.
        for piece in voiced_pcm(BYTES_PER_SEC / 2).chunks(4096) {
            let delta = session.process_audio(piece, false).await.unwrap();
            assert!(delta.is_none());
        }
    }

    #[tokio::test]
    async fn test_forced_finalize_flushes_short_tail() {
        let mut session = test_session(Arc::new(FakeTranscriber::new()));
        session.start().await.unwrap();

        // Below the minimum chunk: nothing during streaming...
        let tail = voiced_pcm(BYTES_PER_SEC / 2);
        assert!(session.process_audio(&tail, false).await.unwrap().is_none());

        // ...but forced finalization extracts and transcribes it.
        let delta = session.finalize().await.unwrap();
        assert_eq!(delta.unwrap().append, "hello world");
    }

    #[tokio::test]
    async fn test_finalize_with_empty_buffer_yields_no_delta() {
        let mut session = test_session(Arc::new(FakeTranscriber::new()));
        session.start().await.unwrap();

        assert!(session.finalize().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_whitespace_recognition_yields_no_delta() {
        let mut session = test_session(Arc::new(FakeTranscriber::with_text("   ")));
        session.start().await.unwrap();

        let chunk = voiced_pcm(session.buffer().chunk_bytes());
        let delta = session.process_audio(&chunk, false).await.unwrap();
        assert!(delta.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_without_pipeline() {
        let mut session = test_session(Arc::new(FakeTranscriber::new()));
        session.start().await.unwrap();
        session.cleanup().await;
        session.cleanup().await;
    }

    #[test]
    fn test_default_model_size_comes_from_config() {
        let config = AppConfig::default();
        let session = StreamingSession::new(
            "s",
            direct_format(),
            None,
            Arc::new(FakeTranscriber::new()),
            &config,
        )
        .unwrap();
        assert_eq!(session.model_size, ModelSize::Small);

        let session = StreamingSession::new(
            "s",
            direct_format(),
            Some(ModelSize::Medium),
            Arc::new(FakeTranscriber::new()),
            &config,
        )
        .unwrap();
        assert_eq!(session.model_size, ModelSize::Medium);
    }
}
