//! Bounded inbound audio queue with oldest-first eviction.
//!
//! Producers (the WebSocket reader) never block: once usage exceeds the
//! high-water mark, one corrective pass evicts the oldest frames in capped
//! batches until usage is back at the low-water mark. The consumer (the transcription stage) awaits
//! frames asynchronously.

use crate::config::AudioInputConfig;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

/// One frame of client microphone audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw PCM16 LE mono bytes.
    pub pcm: Bytes,
    /// Client capture timestamp (milliseconds, wrapping).
    pub timestamp_ms: u32,
    /// Whether the client was playing assistant audio when this was captured.
    pub tts_playing: bool,
}

/// Result of pushing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Frames queued after the push (and any eviction).
    pub queued: usize,
    /// Frames evicted by this push.
    pub evicted: usize,
}

#[derive(Debug)]
pub struct AudioInputQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    notify: Notify,
    high_water: usize,
    low_water: usize,
    batch: usize,
    evicted_total: AtomicU64,
}

impl AudioInputQueue {
    pub fn new(config: &AudioInputConfig) -> Self {
        let capacity = config.capacity.max(1);
        let high_water = ((capacity as f64) * config.high_water_ratio).round() as usize;
        let low_water = ((capacity as f64) * config.low_water_ratio).round() as usize;
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            high_water: high_water.clamp(1, capacity),
            low_water: low_water.min(high_water.saturating_sub(1)),
            batch: config.max_evictions_per_pass.max(1),
            evicted_total: AtomicU64::new(0),
        }
    }

    /// Queue a frame without blocking, evicting the oldest frames if usage
    /// exceeds the high-water mark.
    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.push_back(frame);
        let mut queued = frames.len();
        drop(frames);
        self.notify.notify_one();

        let mut evicted = 0;
        if queued > self.high_water {
            // The lock is released between batches, so frames the consumer
            // takes meanwhile count towards the restored headroom.
            loop {
                let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
                let take = frames.len().saturating_sub(self.low_water).min(self.batch);
                frames.drain(..take);
                evicted += take;
                queued = frames.len();
                if take == 0 {
                    break;
                }
            }
        }

        if evicted > 0 {
            self.evicted_total
                .fetch_add(evicted as u64, Ordering::Relaxed);
            warn!(evicted, queued, "audio input queue overflow, evicted oldest frames");
        }
        PushOutcome { queued, evicted }
    }

    /// Wait for the next frame.
    pub async fn pop(&self) -> AudioFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted since creation.
    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }
}
