//! Text-to-speech synthesis.
//!
//! The pipeline drives synthesis through [`SynthesisEngine`]. The bundled
//! backend is [`HttpSynthesisEngine`], which streams raw PCM16 from any
//! OpenAI-compatible `/v1/audio/speech` server (Kokoro-FastAPI, openedai-speech, ...).

pub mod http;

pub use http::HttpSynthesisEngine;

use crate::error::Result;
use crate::pipeline::messages::AudioChunk;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// Synthesized audio for one text span, in playback order.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<AudioChunk>> + Send>>;

/// A speech synthesizer.
///
/// Implementations must tolerate many short calls per reply: the pipeline
/// synthesizes the quick answer, the overhang and every final-answer batch
/// separately.
#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    /// Start synthesizing `text`.
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis cannot be started. Mid-stream failures
    /// are yielded as stream items.
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;

    /// Stop any in-flight synthesis. The default does nothing; dropping the
    /// returned stream already closes its connection.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;
}

/// Replace typography that speech engines tend to mispronounce with ASCII.
///
/// Only text handed to the engine is rewritten; stored answer text keeps
/// the model's original characters.
pub fn normalize_for_speech(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{2014}' | '\u{2013}' => out.push('-'),
            '\u{201C}' | '\u{201D}' | '\u{201E}' => out.push('"'),
            '\u{2018}' | '\u{2019}' | '\u{201A}' => out.push('\''),
            '\u{2026}' => out.push_str("..."),
            other => out.push(other),
        }
    }
    out
}
