//! # Whisper Engine (Candle)
//!
//! Candle-backed implementation of the `Transcriber` capability. Engines are
//! created lazily, one per model size, and cached for the lifetime of the
//! process — a session switching sizes or two sessions on different sizes
//! never reload weights.
//!
//! ## Model Loading:
//! 1. Fetch `config.json`, `tokenizer.json` and `model.safetensors` from
//!    HuggingFace (cached on disk by hf-hub)
//! 2. Memory-map the weights into a `VarBuilder`
//! 3. Build the Whisper encoder/decoder pair
//!
//! ## Decoding:
//! Audio is processed in 30-second windows: log-mel features → encoder →
//! greedy token decoding with a repetition guard. Each non-empty window
//! yields one segment with window-relative boundaries.

use crate::transcription::model::{ModelSize, Transcriber, TranscriptOutput, TranscriptSegment};
use anyhow::{anyhow, Context, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Samples per decode window (30 seconds at the canonical rate).
const WINDOW_SAMPLES: usize = 30 * m::SAMPLE_RATE;

/// Upper bound on generated tokens per window.
const MAX_DECODE_TOKENS: usize = 224;

/// Process-wide recognizer with a per-size engine cache.
pub struct WhisperTranscriber {
    device: Device,
    /// Runtime handle for hf-hub downloads; `transcribe_samples` always runs
    /// on the blocking pool, where `Handle::block_on` is legal.
    runtime: tokio::runtime::Handle,
    engines: Mutex<HashMap<ModelSize, Arc<Mutex<WhisperEngine>>>>,
}

impl WhisperTranscriber {
    /// Must be called from within the async runtime (captures its handle).
    pub fn new(device: Device) -> Self {
        Self {
            device,
            runtime: tokio::runtime::Handle::current(),
            engines: Mutex::new(HashMap::new()),
        }
    }

    fn engine_for(&self, size: ModelSize) -> Result<Arc<Mutex<WhisperEngine>>> {
        if let Some(engine) = self.engines.lock().unwrap().get(&size) {
            return Ok(Arc::clone(engine));
        }

        // Load outside the map lock so a slow download cannot block callers
        // that use an already-cached size.
        let loaded = self
            .runtime
            .block_on(WhisperEngine::load(size, self.device.clone()))?;

        let mut engines = self.engines.lock().unwrap();
        let entry = engines
            .entry(size)
            .or_insert_with(|| Arc::new(Mutex::new(loaded)));
        Ok(Arc::clone(entry))
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe_samples(
        &self,
        samples: &[f32],
        language: Option<&str>,
        model_size: ModelSize,
        _word_timestamps: bool,
    ) -> Result<TranscriptOutput> {
        if samples.is_empty() {
            return Err(anyhow!("audio window is empty"));
        }

        let engine = self.engine_for(model_size)?;
        let mut engine = engine.lock().unwrap();
        let (text, segments) = engine.transcribe(samples, language)?;

        Ok(TranscriptOutput {
            text,
            language: language.map(|l| l.to_string()),
            segments,
            model_label: format!("whisper-candle:{}", model_size),
        })
    }
}

/// One loaded Whisper model with its tokenizer and mel filters.
struct WhisperEngine {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    device: Device,

    sot_token: u32,
    eot_token: u32,
    transcribe_token: u32,
    no_timestamps_token: u32,
}

impl WhisperEngine {
    async fn load(size: ModelSize, device: Device) -> Result<Self> {
        info!(model = %size, "Loading Whisper model");
        let start = Instant::now();

        let api = hf_hub::api::tokio::ApiBuilder::new()
            .with_token(std::env::var("HF_TOKEN").ok())
            .with_progress(false)
            .build()
            .context("failed to build HuggingFace API client")?;
        let repo = api.model(size.repo_name().to_string());

        let config_path = repo
            .get("config.json")
            .await
            .with_context(|| format!("failed to fetch config.json from {}", size.repo_name()))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .await
            .with_context(|| format!("failed to fetch tokenizer.json from {}", size.repo_name()))?;
        let weights_path = repo
            .get("model.safetensors")
            .await
            .with_context(|| format!("failed to fetch weights from {}", size.repo_name()))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;
        let mel_filters = mel_filter_bank(config.num_mel_bins);

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &device)?
        };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let token_id = |name: &str| -> Result<u32> {
            tokenizer
                .token_to_id(name)
                .ok_or_else(|| anyhow!("tokenizer is missing the {} token", name))
        };

        let engine = Self {
            sot_token: token_id(m::SOT_TOKEN)?,
            eot_token: token_id(m::EOT_TOKEN)?,
            transcribe_token: token_id(m::TRANSCRIBE_TOKEN)?,
            no_timestamps_token: token_id(m::NO_TIMESTAMPS_TOKEN)?,
            model,
            config,
            tokenizer,
            mel_filters,
            device,
        };

        info!(
            model = %size,
            elapsed_sec = start.elapsed().as_secs_f64(),
            "Whisper model ready"
        );
        Ok(engine)
    }

    /// Transcribe normalized mono samples at the canonical rate.
    fn transcribe(
        &mut self,
        samples: &[f32],
        language: Option<&str>,
    ) -> Result<(String, Vec<TranscriptSegment>)> {
        let total_secs = samples.len() as f64 / m::SAMPLE_RATE as f64;
        let started = Instant::now();

        let mut segments = Vec::new();
        let mut parts: Vec<String> = Vec::new();

        for (index, window) in samples.chunks(WINDOW_SAMPLES).enumerate() {
            // The encoder expects a full 30-second window.
            let mut padded = window.to_vec();
            padded.resize(WINDOW_SAMPLES, 0.0);

            let mel = audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
            let n_frames = mel.len() / self.config.num_mel_bins;
            let mel = Tensor::from_vec(
                mel,
                (1, self.config.num_mel_bins, n_frames),
                &self.device,
            )?;

            let text = self.decode_window(&mel, language)?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            let window_start = index as f64 * 30.0;
            segments.push(TranscriptSegment {
                start: window_start,
                end: total_secs.min(window_start + 30.0),
                text: text.to_string(),
            });
            parts.push(text.to_string());
        }

        debug!(
            audio_sec = total_secs,
            elapsed_sec = started.elapsed().as_secs_f64(),
            segments = segments.len(),
            "Recognition pass finished"
        );

        Ok((parts.join(" ").trim().to_string(), segments))
    }

    /// Greedy decode of one mel window.
    fn decode_window(&mut self, mel: &Tensor, language: Option<&str>) -> Result<String> {
        let features = self.model.encoder.forward(mel, true)?;

        let mut tokens: Vec<u32> = vec![self.sot_token];
        if let Some(lang) = language {
            // Unknown language hints are skipped rather than failing the
            // whole window.
            if let Some(id) = self
                .tokenizer
                .token_to_id(&format!("<|{}|>", lang.to_lowercase()))
            {
                tokens.push(id);
            }
        }
        tokens.push(self.transcribe_token);
        tokens.push(self.no_timestamps_token);

        let mut output: Vec<u32> = Vec::new();

        for step in 0..MAX_DECODE_TOKENS {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&input, &features, step == 0)?;

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits: Vec<f32> = logits.to_vec1()?;

            let next = logits
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(i, _)| i as u32)
                .ok_or_else(|| anyhow!("decoder produced empty logits"))?;

            if next == self.eot_token {
                break;
            }
            if is_repetitive(&output, next) {
                break;
            }

            tokens.push(next);
            output.push(next);
        }

        self.tokenizer
            .decode(&output, true)
            .map_err(|e| anyhow!("tokenizer decode failed: {}", e))
    }
}

/// Runaway-loop guard: stop when the decoder emits the same token three
/// times in a row or repeats its last three-token pattern.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    if tokens.len() >= 2 {
        let n = tokens.len();
        if tokens[n - 1] == next && tokens[n - 2] == next {
            return true;
        }
    }

    if tokens.len() >= 5 {
        let n = tokens.len();
        let candidate = [tokens[n - 2], tokens[n - 1], next];
        if tokens[n - 5..n - 2] == candidate {
            return true;
        }
    }

    false
}

/// Triangular mel filter bank mapping the 201 FFT bins of a 400-point STFT
/// onto `n_mels` mel bands, row-major `[n_mels][n_freqs]` as expected by
/// `audio::pcm_to_mel`.
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    const N_FFT: usize = 400;
    let n_freqs = N_FFT / 2 + 1;
    let sample_rate = m::SAMPLE_RATE as f32;

    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10f32.powf(mel / 2595.0) - 1.0);

    let mel_max = hz_to_mel(sample_rate / 2.0);
    let bin_of = |hz: f32| hz * N_FFT as f32 / sample_rate;

    // n_mels + 2 band edges evenly spaced on the mel scale, in bin space.
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| bin_of(mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32)))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for band in 0..n_mels {
        let (left, center, right) = (edges[band], edges[band + 1], edges[band + 2]);
        for bin in 0..n_freqs {
            let f = bin as f32;
            let weight = if f <= left || f >= right {
                0.0
            } else if f <= center {
                (f - left) / (center - left).max(f32::EPSILON)
            } else {
                (right - f) / (right - center).max(f32::EPSILON)
            };
            filters[band * n_freqs + bin] = weight;
        }
    }

    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetition_guard() {
        // Immediate triple repeat.
        assert!(is_repetitive(&[5, 5], 5));
        assert!(!is_repetitive(&[5, 6], 5));

        // Repeated trigram pattern.
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3));
        assert!(!is_repetitive(&[1, 2, 3, 1, 2], 4));

        // Too short to judge.
        assert!(!is_repetitive(&[], 7));
        assert!(!is_repetitive(&[7], 7));
    }

    #[test]
    fn test_mel_filter_bank_shape_and_coverage() {
        let n_mels = 80;
        let filters = mel_filter_bank(n_mels);
        assert_eq!(filters.len(), n_mels * 201);

        // Every band has some mass and all weights stay in [0, 1].
        for band in 0..n_mels {
            let row = &filters[band * 201..(band + 1) * 201];
            assert!(row.iter().any(|&w| w > 0.0), "band {band} is empty");
            assert!(row.iter().all(|&w| (0.0..=1.0).contains(&w)));
        }
    }
}
