//! Configuration types for the voice pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides [`LlmConfig::api_key`].
pub const LLM_API_KEY_ENV: &str = "CADENCE_LLM_API_KEY";

/// Top-level configuration for the voice pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Orchestrator settings (dispatcher, similarity gate, abort budgets).
    pub pipeline: PipelineConfig,
    /// Quick-answer sentence boundary detection.
    pub boundary: BoundaryConfig,
    /// Final-answer synthesis batching.
    pub final_answer: FinalAnswerConfig,
    /// Startup smoothing for synthesized audio.
    pub audio_buffer: AudioBufferConfig,
    /// Inbound microphone audio queue.
    pub audio_input: AudioInputConfig,
    /// Transcription engine settings.
    pub stt: SttConfig,
    /// Completion engine settings.
    pub llm: LlmConfig,
    /// Speech synthesis settings.
    pub tts: TtsConfig,
    /// WebSocket server settings.
    pub server: ServerConfig,
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Similarity at or above which a new utterance is treated as a revision
    /// of the running one and ignored.
    pub similarity_threshold: f64,
    /// Number of trailing words compared by the similarity gate.
    pub similarity_tail_words: usize,
    /// Identical `prepare` requests arriving within this window are dropped.
    pub duplicate_window_ms: u64,
    /// Upper bound for a blocking abort issued by the dispatcher.
    pub abort_timeout_ms: u64,
    /// Per-stage wait while the abort coordinator stops a worker.
    pub stage_stop_timeout_ms: u64,
    /// Maximum queued dispatcher requests; the oldest is dropped beyond this.
    pub request_queue_capacity: usize,
    /// Capacity of each stage's job channel.
    pub job_channel_capacity: usize,
    /// Capacity of the LLM -> final-answer text channel.
    pub final_text_channel_capacity: usize,
    /// Capacity of each per-generation audio segment channel.
    pub audio_channel_capacity: usize,
    /// Wait budget for a blocking abort during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            similarity_tail_words: 5,
            duplicate_window_ms: 2_000,
            abort_timeout_ms: 7_000,
            stage_stop_timeout_ms: 5_000,
            request_queue_capacity: 64,
            job_channel_capacity: 8,
            final_text_channel_capacity: 256,
            audio_channel_capacity: 512,
            shutdown_timeout_ms: 3_000,
        }
    }
}

impl PipelineConfig {
    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn stage_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_stop_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Sentence boundary detection for the quick answer.
///
/// The minimums are empirically tuned: they keep short interjections and a
/// lone leading comma from becoming the quick answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Accumulated LLM text must exceed this many characters before the
    /// detector runs.
    pub min_accumulated_chars: usize,
    /// Minimum scanned length (in characters, split char included).
    pub min_len: usize,
    /// Maximum span scanned for a boundary.
    pub max_len: usize,
    /// Minimum alphanumeric characters seen before a split is accepted.
    pub min_alnum: usize,
    /// Characters that may end a quick answer.
    pub split_chars: Vec<char>,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            min_accumulated_chars: 20,
            min_len: 6,
            max_len: 120,
            min_alnum: 10,
            split_chars: vec![
                '.', '!', '?', ',', ';', ':', '\n', '-', '。', '、', '！', '？', '，',
            ],
        }
    }
}

/// Final-answer synthesis batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalAnswerConfig {
    /// Flush the pending text once it grows beyond this many characters.
    pub flush_chars: usize,
    /// Flush as soon as an incoming chunk contains one of these.
    pub flush_punctuation: Vec<char>,
}

impl Default for FinalAnswerConfig {
    fn default() -> Self {
        Self {
            flush_chars: 50,
            flush_punctuation: vec!['.', '!', '?', ','],
        }
    }
}

/// Streaming audio buffer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioBufferConfig {
    /// A chunk is on time if it arrives within `duration * tolerance` of the
    /// previous one.
    pub on_time_tolerance: f64,
    /// Consecutive on-time chunks that end buffering.
    pub good_streak: u32,
    /// Buffered playback duration (seconds) that ends buffering.
    pub max_buffered_secs: f64,
}

impl Default for AudioBufferConfig {
    fn default() -> Self {
        Self {
            on_time_tolerance: 1.1,
            good_streak: 2,
            max_buffered_secs: 0.5,
        }
    }
}

/// Inbound audio queue feeding the transcription engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioInputConfig {
    /// Maximum queued frames.
    pub capacity: usize,
    /// Usage ratio that triggers eviction.
    pub high_water_ratio: f64,
    /// Usage ratio eviction aims for.
    pub low_water_ratio: f64,
    /// Upper bound on frames evicted per locked batch of a corrective pass.
    pub max_evictions_per_pass: usize,
    /// Sample rate of client PCM16 audio.
    pub sample_rate: u32,
}

impl Default for AudioInputConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            high_water_ratio: 0.9,
            low_water_ratio: 0.7,
            max_evictions_per_pass: 10,
            sample_rate: 16_000,
        }
    }
}

/// Transcription configuration (energy VAD + OpenAI-compatible
/// `/v1/audio/transcriptions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Whether inbound audio frames are transcribed at all.
    pub enabled: bool,
    /// Base URL of the transcription server.
    pub api_url: String,
    /// Model name sent with each request.
    pub model: String,
    /// Bearer token. Empty for local servers.
    pub api_key: String,
    /// Language hint passed to the server. Empty to auto-detect.
    pub language: String,
    /// Normalised RMS energy (0.0..1.0) above which a frame counts as speech.
    pub energy_threshold: f32,
    /// Silence that ends an utterance.
    pub min_silence_ms: u32,
    /// Utterances shorter than this are discarded.
    pub min_speech_ms: u32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // faster-whisper-server default endpoint.
            api_url: "http://localhost:8000".to_owned(),
            model: "Systran/faster-whisper-small".to_owned(),
            api_key: String::new(),
            language: String::new(),
            energy_threshold: 0.015,
            min_silence_ms: 600,
            min_speech_ms: 250,
        }
    }
}

/// Completion engine configuration (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the API server; `/v1/chat/completions` is appended.
    pub api_url: String,
    /// Model name to request.
    pub api_model: String,
    /// Bearer token. Empty for local servers.
    pub api_key: String,
    /// System prompt prepended to every request.
    pub system_prompt: String,
    /// Maximum tokens to generate per reply.
    pub max_tokens: usize,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum history messages retained (excluding the system prompt).
    ///
    /// Set to 0 to disable trimming.
    pub max_history_messages: usize,
    /// Request timeout in seconds for establishing the stream.
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            // Ollama default endpoint.
            api_url: "http://localhost:11434".to_owned(),
            api_model: "llama3.2:3b".to_owned(),
            api_key: String::new(),
            system_prompt: "You are a helpful voice assistant. Answer in one to three short, \
                            natural spoken sentences. Never use lists, markdown or emoji."
                .to_owned(),
            max_tokens: 300,
            temperature: 0.7,
            max_history_messages: 24,
            connect_timeout_secs: 10,
        }
    }
}

/// Speech synthesis configuration (OpenAI-compatible `/v1/audio/speech`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Base URL of the speech server.
    pub api_url: String,
    /// Model name sent with each request.
    pub model: String,
    /// Voice name.
    pub voice: String,
    /// Bearer token. Empty for local servers.
    pub api_key: String,
    /// Output sample rate of the raw PCM16 mono stream.
    pub sample_rate: u32,
    /// Samples per emitted chunk (100 ms at 24 kHz by default).
    pub chunk_samples: usize,
    /// Speech speed multiplier.
    pub speed: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            // Kokoro-FastAPI default endpoint.
            api_url: "http://localhost:8880".to_owned(),
            model: "kokoro".to_owned(),
            voice: "af_heart".to_owned(),
            api_key: String::new(),
            sample_rate: 24_000,
            chunk_samples: 2_400,
            speed: 1.0,
        }
    }
}

/// WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub bind_addr: String,
    /// Capacity of each connection's outbound message queue.
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_owned(),
            outbound_capacity: 1_024,
        }
    }
}

impl SpeechConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::SpeechError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SpeechError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/cadence/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp/cadence-config"))
            .join("cadence")
            .join("config.toml")
    }

    /// Apply environment overrides (currently the LLM API key).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(LLM_API_KEY_ENV)
            && !key.trim().is_empty()
        {
            self.llm.api_key = key.trim().to_owned();
        }
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::Config`](crate::error::SpeechError::Config)
    /// describing the first violated constraint.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::SpeechError;

        let p = &self.pipeline;
        if !(0.0..=1.0).contains(&p.similarity_threshold) {
            return Err(SpeechError::Config(format!(
                "pipeline.similarity_threshold must be within [0, 1], got {}",
                p.similarity_threshold
            )));
        }
        if p.request_queue_capacity == 0
            || p.job_channel_capacity == 0
            || p.final_text_channel_capacity == 0
            || p.audio_channel_capacity == 0
        {
            return Err(SpeechError::Config(
                "pipeline channel capacities must be non-zero".to_owned(),
            ));
        }
        if self.boundary.min_len > self.boundary.max_len {
            return Err(SpeechError::Config(format!(
                "boundary.min_len ({}) exceeds boundary.max_len ({})",
                self.boundary.min_len, self.boundary.max_len
            )));
        }
        let a = &self.audio_input;
        if a.capacity == 0 || !(0.0 < a.low_water_ratio && a.low_water_ratio < a.high_water_ratio)
        {
            return Err(SpeechError::Config(
                "audio_input requires capacity > 0 and 0 < low_water_ratio < high_water_ratio"
                    .to_owned(),
            ));
        }
        if a.sample_rate == 0 {
            return Err(SpeechError::Config(
                "audio_input.sample_rate must be non-zero".to_owned(),
            ));
        }
        if self.tts.sample_rate == 0 || self.tts.chunk_samples == 0 {
            return Err(SpeechError::Config(
                "tts.sample_rate and tts.chunk_samples must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}
