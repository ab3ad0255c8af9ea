//! Cadence: real-time conversational voice pipeline.
//!
//! Client audio arrives over a WebSocket and flows through a cascade:
//! STT → dispatcher → LLM → quick-answer TTS / final-answer TTS → client.
//!
//! # Architecture
//!
//! - **Transport**: per-connection sessions speaking a JSON + binary PCM protocol
//! - **STT**: energy-gated utterances transcribed by an HTTP Whisper server
//! - **Pipeline**: one current generation at a time, split into a quick
//!   answer (the first sentence) and the final answer (the rest), both
//!   interruptible at any point
//! - **LLM / TTS**: OpenAI-compatible streaming HTTP engines

pub mod audio;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod runtime;
pub mod stt;
pub mod transport;
pub mod tts;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::SpeechConfig;
pub use error::{Result, SpeechError};
pub use pipeline::coordinator::{PipelineCoordinator, ReplyHandle};
pub use runtime::PipelineEvent;
