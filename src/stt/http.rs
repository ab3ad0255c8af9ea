//! Energy-gated transcription over an OpenAI-compatible HTTP API.
//!
//! An RMS energy detector splits the incoming audio into utterances. Each
//! finished utterance is encoded as a WAV file and uploaded to
//! `/v1/audio/transcriptions` (faster-whisper-server, whisper.cpp server,
//! OpenAI, ...).

use crate::config::SttConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::decode_pcm16;
use crate::stt::{TranscriptEvent, TranscriptionEngine};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info};

/// Transcription engine with a built-in energy voice-activity detector.
pub struct HttpTranscriptionEngine {
    config: SttConfig,
    url: String,
    client: reqwest::Client,
    vad: EnergyVad,
}

impl std::fmt::Debug for HttpTranscriptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTranscriptionEngine")
            .field("url", &self.url)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl HttpTranscriptionEngine {
    /// Create an engine for audio at `sample_rate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &SttConfig, sample_rate: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SpeechError::Stt(format!("failed to build HTTP client: {e}")))?;
        let base = config.api_url.trim_end_matches('/');
        let base = base.strip_suffix("/v1").unwrap_or(base);
        let url = format!("{base}/v1/audio/transcriptions");

        info!("STT configured: {url} model={}", config.model);

        Ok(Self {
            config: config.clone(),
            url,
            client,
            vad: EnergyVad::new(config, sample_rate),
        })
    }

    async fn transcribe(&self, samples: &[i16]) -> Result<String> {
        let wav = encode_wav(samples, self.vad.sample_rate)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| SpeechError::Stt(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("response_format", "json");
        if !self.config.language.is_empty() {
            form = form.text("language", self.config.language.clone());
        }

        let mut builder = self.client.post(&self.url).multipart(form);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| SpeechError::Stt(format!("transcription request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(SpeechError::Stt(format!(
                "transcription HTTP {}: {body_text}",
                status.as_u16()
            )));
        }
        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| SpeechError::Stt(format!("invalid transcription response: {e}")))?;
        Ok(body.text.trim().to_owned())
    }
}

#[async_trait]
impl TranscriptionEngine for HttpTranscriptionEngine {
    async fn feed_audio(&mut self, pcm: &[u8]) -> Result<Vec<TranscriptEvent>> {
        let samples = decode_pcm16(pcm);
        let mut events = Vec::new();
        match self.vad.process(&samples) {
            VadStep::Idle | VadStep::Continuing => {}
            VadStep::Started => events.push(TranscriptEvent::SpeechStart),
            VadStep::Ended(utterance) => {
                let duration_ms = utterance.len() as u64 * 1_000 / u64::from(self.vad.sample_rate);
                debug!(duration_ms, "utterance ended, transcribing");
                let text = self.transcribe(&utterance).await?;
                if !text.is_empty() {
                    events.push(TranscriptEvent::Final(text));
                }
            }
        }
        Ok(events)
    }

    fn reset(&mut self) {
        self.vad.reset();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum VadStep {
    Idle,
    Started,
    Continuing,
    /// A long enough utterance ended; carries its samples.
    Ended(Vec<i16>),
}

/// RMS energy utterance detector.
#[derive(Debug)]
struct EnergyVad {
    sample_rate: u32,
    threshold: f32,
    silence_samples_to_end: usize,
    min_speech_samples: usize,
    in_speech: bool,
    buffer: Vec<i16>,
    trailing_silence: usize,
}

impl EnergyVad {
    fn new(config: &SttConfig, sample_rate: u32) -> Self {
        let per_ms = |ms: u32| (u64::from(ms) * u64::from(sample_rate) / 1_000) as usize;
        Self {
            sample_rate: sample_rate.max(1),
            threshold: config.energy_threshold,
            silence_samples_to_end: per_ms(config.min_silence_ms).max(1),
            min_speech_samples: per_ms(config.min_speech_ms),
            in_speech: false,
            buffer: Vec::new(),
            trailing_silence: 0,
        }
    }

    fn process(&mut self, samples: &[i16]) -> VadStep {
        if samples.is_empty() {
            return VadStep::Idle;
        }
        let is_speech = rms_energy(samples) > self.threshold;

        if is_speech {
            self.trailing_silence = 0;
            self.buffer.extend_from_slice(samples);
            if !self.in_speech {
                self.in_speech = true;
                return VadStep::Started;
            }
            return VadStep::Continuing;
        }
        if !self.in_speech {
            return VadStep::Idle;
        }

        // Keep short pauses inside the utterance.
        self.trailing_silence += samples.len();
        self.buffer.extend_from_slice(samples);
        if self.trailing_silence < self.silence_samples_to_end {
            return VadStep::Continuing;
        }

        self.in_speech = false;
        let speech = self.buffer.len().saturating_sub(self.trailing_silence);
        self.trailing_silence = 0;
        let utterance = std::mem::take(&mut self.buffer);
        if speech >= self.min_speech_samples {
            VadStep::Ended(utterance)
        } else {
            debug!(speech_samples = speech, "discarding short utterance");
            VadStep::Idle
        }
    }

    fn reset(&mut self) {
        self.in_speech = false;
        self.buffer.clear();
        self.trailing_silence = 0;
    }
}

/// RMS energy normalised to `0.0..=1.0`.
fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32_768.0;
            v * v
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_err = |e: hound::Error| SpeechError::Stt(format!("WAV encoding failed: {e}"));
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_err)?;
        for &sample in samples {
            writer.write_sample(sample).map_err(wav_err)?;
        }
        writer.finalize().map_err(wav_err)?;
    }
    Ok(cursor.into_inner())
}
