//! Speech-to-text for inbound client audio.
//!
//! The transcription stage drains the backpressured [`AudioInputQueue`]
//! into a [`TranscriptionEngine`] and hands whatever it recognises to a
//! [`TranscriptionSink`]. Final text becomes a `prepare` request; partial
//! text is advisory.

pub mod http;

pub use http::HttpTranscriptionEngine;

use crate::audio::input_queue::AudioInputQueue;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something a transcription engine recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// The user started speaking.
    SpeechStart,
    /// Provisional text for the utterance in progress.
    Partial(String),
    /// Text of a finished utterance.
    Final(String),
}

/// A streaming speech recogniser fed with raw PCM16 LE mono bytes.
#[async_trait]
pub trait TranscriptionEngine: Send {
    /// Feed the next block of audio and collect whatever it completed.
    ///
    /// # Errors
    ///
    /// Returns an error if recognition of a finished utterance fails. The
    /// engine stays usable.
    async fn feed_audio(&mut self, pcm: &[u8]) -> Result<Vec<TranscriptEvent>>;

    /// Drop any partially heard utterance.
    fn reset(&mut self) {}
}

/// Receiver of transcription results.
#[async_trait]
pub trait TranscriptionSink: Send + Sync {
    async fn on_transcript(&self, event: TranscriptEvent);
}

/// Feed queued audio into `engine` until `cancel` fires.
pub async fn run_transcription_stage(
    mut engine: Box<dyn TranscriptionEngine>,
    queue: Arc<AudioInputQueue>,
    sink: Arc<dyn TranscriptionSink>,
    cancel: CancellationToken,
) {
    info!("transcription stage started");
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = queue.pop() => frame,
        };
        match engine.feed_audio(&frame.pcm).await {
            Ok(events) => {
                for event in events {
                    debug!(?event, "transcript event");
                    sink.on_transcript(event).await;
                }
            }
            Err(e) => {
                warn!("transcription failed: {e}");
                engine.reset();
            }
        }
    }
    info!("transcription stage stopped");
}
