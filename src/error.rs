//! Error types for the cadence pipeline.

/// Top-level error type for the voice pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Completion engine error (request, stream or decode failure).
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Client transport error (framing, serialization, socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;
