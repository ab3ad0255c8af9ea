//! Startup smoothing for synthesized audio.
//!
//! Engines often deliver their first chunks irregularly. The buffer holds
//! chunks back until either delivery looks steady (a streak of on-time
//! chunks) or enough audio has accumulated to ride out a gap, then switches
//! to pass-through. One instance is used per synthesis run so timing state
//! never leaks between segments.

use crate::config::AudioBufferConfig;
use crate::pipeline::messages::AudioChunk;
use std::time::Instant;

#[derive(Debug)]
pub struct StreamingAudioBuffer {
    on_time_tolerance: f64,
    good_streak: u32,
    max_buffered_secs: f64,
    buffering: bool,
    pending: Vec<AudioChunk>,
    buffered_secs: f64,
    streak: u32,
    last_arrival: Option<Instant>,
}

impl StreamingAudioBuffer {
    pub fn new(config: &AudioBufferConfig) -> Self {
        Self {
            on_time_tolerance: config.on_time_tolerance,
            good_streak: config.good_streak,
            max_buffered_secs: config.max_buffered_secs,
            buffering: true,
            pending: Vec::new(),
            buffered_secs: 0.0,
            streak: 0,
            last_arrival: None,
        }
    }

    /// Feed one chunk that arrived at `arrived_at`; returns the chunks that
    /// are ready to send downstream, in arrival order.
    pub fn push(&mut self, chunk: AudioChunk, arrived_at: Instant) -> Vec<AudioChunk> {
        let duration = chunk.duration_secs();
        if let Some(previous) = self.last_arrival {
            let gap = arrived_at.saturating_duration_since(previous).as_secs_f64();
            if gap <= duration * self.on_time_tolerance {
                self.streak += 1;
            } else {
                self.streak = 0;
            }
        }
        self.last_arrival = Some(arrived_at);

        if !self.buffering {
            return vec![chunk];
        }

        self.buffered_secs += duration;
        self.pending.push(chunk);
        if self.streak >= self.good_streak || self.buffered_secs >= self.max_buffered_secs {
            self.buffering = false;
            return std::mem::take(&mut self.pending);
        }
        Vec::new()
    }

    /// Whether chunks are still being held back.
    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Release anything still held back at the end of the run.
    pub fn finish(self) -> Vec<AudioChunk> {
        self.pending
    }
}
