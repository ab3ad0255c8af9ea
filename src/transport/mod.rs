//! WebSocket client protocol.
//!
//! Text frames carry JSON messages of the form `{"type": ..., "content": ...}`.
//! Binary frames carry microphone audio: an 8-byte big-endian header
//! (`u32` capture timestamp in milliseconds, `u32` flags) followed by raw
//! PCM16 LE mono samples.

pub mod server;
pub mod session;

pub use server::{AppState, router, serve};
pub use session::{Session, SessionEngines, TranscriberFactory};

use crate::audio::input_queue::AudioFrame;
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::AudioChunk;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Length of the binary audio frame header.
pub const FRAME_HEADER_LEN: usize = 8;

/// Header flag: the client was playing assistant audio during capture.
pub const FLAG_TTS_PLAYING: u32 = 1;

/// Server to client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when the connection opens.
    SessionInfo {
        session_id: String,
        status: String,
        /// Sample rate of the `tts_chunk` audio.
        sample_rate: u32,
    },
    /// Provisional transcript of the utterance in progress.
    PartialUserRequest(String),
    /// The utterance a reply answers.
    FinalUserRequest(String),
    /// The quick answer, sent before its audio.
    PartialAssistantAnswer(String),
    /// Base64 PCM16 LE mono audio.
    TtsChunk(String),
    /// The whole reply text, once per completed reply.
    FinalAssistantAnswer(String),
    /// Stop playback immediately.
    StopTts,
    /// The reply was cut off.
    TtsInterruption,
    Pong,
    /// A client message could not be handled.
    Error(String),
}

impl ServerMessage {
    pub fn tts_chunk(chunk: &AudioChunk) -> Self {
        let mut raw = Vec::with_capacity(chunk.samples.len() * 2);
        for sample in &chunk.samples {
            raw.extend_from_slice(&sample.to_le_bytes());
        }
        Self::TtsChunk(BASE64.encode(raw))
    }

    /// Final answer with runs of whitespace collapsed to single spaces.
    pub fn final_answer(text: &str) -> Self {
        Self::FinalAssistantAnswer(collapse_whitespace(text))
    }
}

/// Client to server message. Unknown types deserialize to
/// [`ClientMessage::Unknown`] and are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Typed input, handled like a finished utterance.
    UserText { content: String },
    /// Queue an abort of the current reply.
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Stop the current reply immediately.
    Stop,
    /// Stop any reply and forget the conversation.
    ClearHistory,
    Ping,
    /// The client started playing reply audio.
    TtsStart,
    /// The client finished or stopped playing reply audio.
    TtsStop,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::Transport`] if the frame is not a JSON object
    /// with a string `type`.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SpeechError::Transport(format!("invalid client message: {e}")))
    }
}

/// Split a binary frame into its header fields and PCM payload.
///
/// # Errors
///
/// Returns [`SpeechError::Transport`] if the frame is shorter than the header.
pub fn parse_audio_frame(raw: Bytes) -> Result<AudioFrame> {
    if raw.len() < FRAME_HEADER_LEN {
        return Err(SpeechError::Transport(format!(
            "audio frame of {} bytes is shorter than its {FRAME_HEADER_LEN}-byte header",
            raw.len()
        )));
    }
    let word = |at: usize| u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
    let timestamp_ms = word(0);
    let flags = word(4);
    Ok(AudioFrame {
        pcm: raw.slice(FRAME_HEADER_LEN..),
        timestamp_ms,
        tts_playing: flags & FLAG_TTS_PLAYING != 0,
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
