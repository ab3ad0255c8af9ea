//! Streaming speech synthesis over an OpenAI-compatible HTTP API.

use crate::config::TtsConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::{AudioChunk, decode_pcm16};
use crate::tts::{AudioStream, SynthesisEngine};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info};

/// Synthesis engine posting to `/v1/audio/speech` with `response_format = "pcm"`.
///
/// The server replies with raw little-endian PCM16 mono at
/// [`TtsConfig::sample_rate`]; the body is re-chunked into fixed-size
/// [`AudioChunk`]s as bytes arrive.
#[derive(Debug)]
pub struct HttpSynthesisEngine {
    config: TtsConfig,
    url: String,
    client: reqwest::Client,
}

impl HttpSynthesisEngine {
    /// Create a new engine for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SpeechError::Tts(format!("failed to build HTTP client: {e}")))?;
        let base = config.api_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        let url = format!("{base}/v1/audio/speech");

        info!(
            "TTS configured: {url} model={} voice={}",
            config.model, config.voice
        );

        Ok(Self {
            config: config.clone(),
            url,
            client,
        })
    }
}

#[async_trait]
impl SynthesisEngine for HttpSynthesisEngine {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": text,
            "voice": self.config.voice,
            "response_format": "pcm",
            "speed": self.config.speed,
            "stream": true,
        });

        let mut builder = self.client.post(&self.url).json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SpeechError::Tts(format!("speech request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(SpeechError::Tts(format!(
                "speech HTTP {}: {body_text}",
                status.as_u16()
            )));
        }

        debug!(chars = text.chars().count(), "synthesis stream opened");
        Ok(Box::pin(pcm_chunks(
            response.bytes_stream(),
            self.config.sample_rate,
            self.config.chunk_samples,
        )))
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

/// Re-chunk a PCM16 LE byte stream into `chunk_samples`-sized chunks.
///
/// The final chunk may be shorter. An odd trailing byte is discarded.
fn pcm_chunks(
    bytes: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    sample_rate: u32,
    chunk_samples: usize,
) -> impl Stream<Item = Result<AudioChunk>> + Send {
    let chunk_bytes = chunk_samples.max(1) * 2;
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut pending: Vec<u8> = Vec::with_capacity(chunk_bytes * 2);

        while let Some(next) = bytes.next().await {
            match next {
                Ok(data) => {
                    pending.extend_from_slice(&data);
                    while pending.len() >= chunk_bytes {
                        let raw: Vec<u8> = pending.drain(..chunk_bytes).collect();
                        yield Ok(AudioChunk::new(decode_pcm16(&raw), sample_rate));
                    }
                }
                Err(e) => {
                    yield Err(SpeechError::Tts(format!("speech stream read error: {e}")));
                    return;
                }
            }
        }

        if pending.len() % 2 == 1 {
            debug!("dropping odd trailing PCM byte");
            pending.pop();
        }
        if !pending.is_empty() {
            yield Ok(AudioChunk::new(decode_pcm16(&pending), sample_rate));
        }
    }
}
