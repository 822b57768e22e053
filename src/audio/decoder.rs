//! # Decode Pipeline
//!
//! Wraps an external FFmpeg process that converts an arbitrary supported
//! container/codec byte stream into canonical PCM. Encoded bytes go in via
//! stdin; a background reader task continuously drains decoded PCM from
//! stdout into the session's `StreamBuffer` until end-of-stream.
//!
//! ## Ownership:
//! Each converting session owns exactly one pipeline (process + reader
//! task). The lifecycle is a simple linear state machine:
//! `start → feed* → close_input → stop`, with `stop` safe from any state
//! and from any termination path.

use crate::audio::buffer::StreamBuffer;
use crate::audio::format::{AudioFormat, StreamFormat, SAMPLE_RATE};
use anyhow::{anyhow, Context, Result};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Read size for the stdout drain loop.
const READ_CHUNK: usize = 4096;

/// FFmpeg child process plus its background stdout reader.
pub struct DecodePipeline {
    format: AudioFormat,
    buffer: Arc<StreamBuffer>,
    session_id: String,

    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
}

impl DecodePipeline {
    pub fn new(format: AudioFormat, buffer: Arc<StreamBuffer>, session_id: impl Into<String>) -> Self {
        Self {
            format,
            buffer,
            session_id: session_id.into(),
            child: None,
            stdin: None,
            reader: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.child.is_some()
    }

    /// Launch the decoder process and the background reader.
    ///
    /// Failure to spawn is fatal to the session; the caller is expected to
    /// abort with an internal error.
    pub async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let args = decoder_args(&self.format)?;

        info!(
            session_id = %self.session_id,
            format = %self.format.format,
            rate = self.format.sample_rate,
            "Starting FFmpeg decoder"
        );

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn ffmpeg decoder")?;

        self.stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout was not captured"))?;

        let buffer = Arc::clone(&self.buffer);
        let session_id = self.session_id.clone();

        // Drain decoded PCM until EOF. A decoder that dies mid-stream just
        // stops producing bytes; the session is not aborted from here.
        self.reader = Some(tokio::spawn(async move {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => {
                        debug!(session_id = %session_id, "Decoder output reached end-of-stream");
                        break;
                    }
                    Ok(n) => buffer.append(&chunk[..n]),
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Decoder read error");
                        break;
                    }
                }
            }
        }));

        self.child = Some(child);
        Ok(())
    }

    /// Write encoded bytes to the decoder, starting it first if the caller
    /// never did. Writes into a closed pipe are dropped silently; by then
    /// the stream is shutting down and the bytes have nowhere to go.
    pub async fn feed(&mut self, data: &[u8]) -> Result<()> {
        if self.child.is_none() {
            self.start().await?;
        }

        if let Some(stdin) = self.stdin.as_mut() {
            if let Err(e) = stdin.write_all(data).await {
                debug!(
                    session_id = %self.session_id,
                    error = %e,
                    "Dropping audio bytes: decoder input closed"
                );
            }
        }

        Ok(())
    }

    /// Half-close: signal end-of-input so the decoder flushes and the reader
    /// sees end-of-stream. Best-effort.
    pub async fn close_input(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Idempotent teardown: cancel the reader, kill the process if it is
    /// still running, and reap it. All failures are swallowed — this runs on
    /// cleanup paths where resource reclamation is the only goal.
    pub async fn stop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }

        self.stdin.take();

        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// FFmpeg argument list for one session's format descriptor.
///
/// Container inputs are identified by format tag; raw PCM inputs need the
/// declared source rate. Output is always canonical PCM on stdout.
fn decoder_args(format: &AudioFormat) -> Result<Vec<String>> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-fflags",
        "+discardcorrupt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    match format.format {
        StreamFormat::Webm | StreamFormat::Ogg | StreamFormat::Mp3 | StreamFormat::Wav | StreamFormat::Flac => {
            args.extend(["-f".into(), format.format.as_str().into(), "-i".into(), "pipe:0".into()]);
        }
        // The m4a container is read by FFmpeg's mp4 demuxer.
        StreamFormat::M4a => {
            args.extend(["-f".into(), "mp4".into(), "-i".into(), "pipe:0".into()]);
        }
        StreamFormat::S16le | StreamFormat::F32le => {
            if format.sample_rate == 0 {
                return Err(anyhow!("source sample rate required for raw PCM input"));
            }
            args.extend([
                "-f".into(),
                format.format.as_str().into(),
                "-ar".into(),
                format.sample_rate.to_string(),
                "-ac".into(),
                "1".into(),
                "-i".into(),
                "pipe:0".into(),
            ]);
        }
    }

    args.extend([
        "-ac".into(),
        "1".into(),
        "-ar".into(),
        SAMPLE_RATE.to_string(),
        "-f".into(),
        "s16le".into(),
        "pipe:1".into(),
    ]);

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn pipeline_for(format: AudioFormat) -> DecodePipeline {
        let buffer = Arc::new(StreamBuffer::new(&AppConfig::default().streaming));
        DecodePipeline::new(format, buffer, "test-session")
    }

    #[test]
    fn test_container_args_use_format_tag() {
        let format = AudioFormat::new(StreamFormat::Webm, None);
        let args = decoder_args(&format).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-f webm -i pipe:0"));
        assert!(joined.ends_with("-ac 1 -ar 16000 -f s16le pipe:1"));
    }

    #[test]
    fn test_m4a_maps_to_mp4_demuxer() {
        let format = AudioFormat::new(StreamFormat::M4a, None);
        let args = decoder_args(&format).unwrap();
        assert!(args.join(" ").contains("-f mp4 -i pipe:0"));
    }

    #[test]
    fn test_raw_args_carry_declared_rate() {
        let format = AudioFormat::new(StreamFormat::F32le, Some(48_000));
        let args = decoder_args(&format).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-f f32le -ar 48000 -ac 1 -i pipe:0"));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_safe() {
        let mut pipeline = pipeline_for(AudioFormat::new(StreamFormat::Webm, None));
        assert!(!pipeline.is_started());
        // Teardown must be callable when nothing was ever launched, and
        // repeatedly.
        pipeline.stop().await;
        pipeline.stop().await;
        pipeline.close_input().await;
    }
}
