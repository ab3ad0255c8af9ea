//! Message types passed between pipeline stages.

use std::time::{Duration, Instant};

/// A chunk of synthesized PCM16 mono audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Signed 16-bit samples, mono.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Playback duration.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs())
    }

    /// Samples as little-endian bytes, the wire format clients expect.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Decode little-endian PCM16 bytes. An odd trailing byte is ignored.
pub fn decode_pcm16(raw: &[u8]) -> Vec<i16> {
    raw.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// What a dispatcher request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Start a reply to this user text.
    Prepare(String),
    /// Stop the running reply.
    Abort(String),
}

/// A request queued for the dispatcher.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub kind: RequestKind,
    /// When the request was queued.
    pub received_at: Instant,
}

impl PipelineRequest {
    pub fn prepare(text: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Prepare(text.into()),
            received_at: Instant::now(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Abort(reason.into()),
            received_at: Instant::now(),
        }
    }

    /// The text of a `prepare` request.
    pub fn prepare_text(&self) -> Option<&str> {
        match &self.kind {
            RequestKind::Prepare(text) => Some(text),
            RequestKind::Abort(_) => None,
        }
    }
}
