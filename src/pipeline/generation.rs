//! Lifecycle state for one user utterance's reply.
//!
//! A [`Generation`] is created by the dispatcher, shared (behind `Arc`) with
//! the three stage workers, and retired by the abort coordinator or by
//! being superseded. Every field has a single writer:
//!
//! | field | writer |
//! |---|---|
//! | token stream | opened, consumed and dropped by the LLM stage alone |
//! | quick answer, `quick_answer_ready`, `llm` flags | LLM stage |
//! | final answer, `final_synth` flags | final-answer synthesis stage |
//! | `quick_synth` flags | quick-answer synthesis stage |
//! | cancellation | abort coordinator, or a failing stage |

use crate::pipeline::messages::AudioChunk;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// A write-once flag that can be awaited.
#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    /// Set the flag. Returns `true` only for the call that actually set it.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|value| {
            if *value {
                false
            } else {
                *value = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|value| *value).await;
    }

    /// Wait until the flag is set or `timeout` elapses. Returns whether it was set.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

/// Started/finished flags owned by one stage.
#[derive(Debug, Default)]
pub struct StageFlags {
    pub started: Latch,
    pub finished: Latch,
}

/// The first sentence of a reply and the text that arrived after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickAnswer {
    pub text: String,
    /// Text already received past the boundary; spoken first by the final stage.
    pub overhang: String,
}

/// How a generation ended, as seen by a reply consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Every stage finished; `text` is the whole reply.
    Completed { text: String },
    /// The abort coordinator stopped the reply.
    Aborted { reason: String },
    /// A stage failed and stopped the reply.
    Failed { error: String },
}

/// Full lifecycle state of one reply.
pub struct Generation {
    id: u64,
    source_text: String,
    created_at: Instant,
    cancel: CancellationToken,
    stop_reason: OnceLock<StopReason>,
    quick_answer: OnceLock<QuickAnswer>,
    final_answer: Mutex<String>,
    quick_answer_ready: Latch,
    completed: Latch,
    pub llm: StageFlags,
    pub quick_synth: StageFlags,
    pub final_synth: StageFlags,
}

#[derive(Debug, Clone)]
enum StopReason {
    Aborted(String),
    Failed(String),
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("source_text", &self.source_text)
            .field("aborting", &self.is_aborting())
            .field("quick_answer", &self.quick_answer.get())
            .finish_non_exhaustive()
    }
}

/// Channel ends handed to the stage workers for one generation.
pub struct GenerationChannels {
    /// LLM stage -> final stage. Dropping the sender means "text complete".
    pub final_text_tx: mpsc::Sender<String>,
    pub final_text_rx: mpsc::Receiver<String>,
    /// Quick stage -> reply consumer.
    pub quick_audio_tx: mpsc::Sender<AudioChunk>,
    /// Final stage -> reply consumer.
    pub final_audio_tx: mpsc::Sender<AudioChunk>,
}

/// Capacities for the per-generation channels.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSizes {
    pub final_text: usize,
    pub audio: usize,
}

impl Generation {
    /// Create a generation together with its channels and its audio reader.
    pub fn new(
        id: u64,
        source_text: impl Into<String>,
        sizes: ChannelSizes,
    ) -> (std::sync::Arc<Self>, GenerationChannels, GenerationAudio) {
        let (final_text_tx, final_text_rx) = mpsc::channel(sizes.final_text.max(1));
        let (quick_audio_tx, quick_audio_rx) = mpsc::channel(sizes.audio.max(1));
        let (final_audio_tx, final_audio_rx) = mpsc::channel(sizes.audio.max(1));

        let generation = std::sync::Arc::new(Self {
            id,
            source_text: source_text.into(),
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
            stop_reason: OnceLock::new(),
            quick_answer: OnceLock::new(),
            final_answer: Mutex::new(String::new()),
            quick_answer_ready: Latch::new(),
            completed: Latch::new(),
            llm: StageFlags::default(),
            quick_synth: StageFlags::default(),
            final_synth: StageFlags::default(),
        });
        let channels = GenerationChannels {
            final_text_tx,
            final_text_rx,
            quick_audio_tx,
            final_audio_tx,
        };
        let audio = GenerationAudio {
            quick: Some(quick_audio_rx),
            final_: final_audio_rx,
        };
        (generation, channels, audio)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Token cancelled once the generation starts stopping.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether an abort (or a stage failure) has started. Once true, no stage
    /// may start new work for this generation.
    pub fn is_aborting(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claim the abort. Returns `false` if the generation was already stopping.
    pub fn begin_abort(&self, reason: &str) -> bool {
        let claimed = self
            .stop_reason
            .set(StopReason::Aborted(reason.to_owned()))
            .is_ok();
        self.cancel.cancel();
        claimed
    }

    /// Stop the generation because a stage failed. Returns `false` if it was
    /// already stopping.
    pub fn fail(&self, error: &str) -> bool {
        let claimed = self
            .stop_reason
            .set(StopReason::Failed(error.to_owned()))
            .is_ok();
        self.cancel.cancel();
        claimed
    }

    /// Record the quick answer. Returns `false` if one was already set.
    pub fn set_quick_answer(&self, text: String, overhang: String) -> bool {
        let stored = self.quick_answer.set(QuickAnswer { text, overhang }).is_ok();
        if stored {
            self.quick_answer_ready.set();
        }
        stored
    }

    pub fn quick_answer(&self) -> Option<&QuickAnswer> {
        self.quick_answer.get()
    }

    pub fn is_quick_answer_ready(&self) -> bool {
        self.quick_answer_ready.is_set()
    }

    pub fn quick_answer_ready(&self) -> &Latch {
        &self.quick_answer_ready
    }

    /// Append pulled final-answer text.
    pub fn append_final_answer(&self, chunk: &str) {
        self.final_answer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(chunk);
    }

    pub fn final_answer(&self) -> String {
        self.final_answer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `quick answer + overhang + final answer`, exactly as streamed.
    pub fn assembled_text(&self) -> String {
        let mut text = String::new();
        if let Some(quick) = self.quick_answer.get() {
            text.push_str(&quick.text);
            text.push_str(&quick.overhang);
        }
        text.push_str(&self.final_answer());
        text
    }

    /// Whether all three stages have set their finished flags.
    pub fn all_stages_finished(&self) -> bool {
        self.llm.finished.is_set()
            && self.quick_synth.finished.is_set()
            && self.final_synth.finished.is_set()
    }

    /// Mark every stage finished. Used by the abort path once the stages have
    /// been waited on, so observers never see a stopped generation with
    /// unfinished stages.
    pub fn mark_stages_finished(&self) {
        self.llm.finished.set();
        self.quick_synth.finished.set();
        self.final_synth.finished.set();
    }

    /// Record normal completion. Returns `true` only for the first caller, and
    /// only if the generation is not stopping.
    pub fn mark_completed(&self) -> bool {
        !self.is_aborting() && self.all_stages_finished() && self.completed.set()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_set()
    }

    /// Wait until the generation completes or starts stopping.
    pub async fn outcome(&self) -> ReplyOutcome {
        tokio::select! {
            biased;
            () = self.completed.wait() => {}
            () = self.cancel.cancelled() => {}
        }
        self.current_outcome()
            .unwrap_or_else(|| ReplyOutcome::Aborted {
                reason: String::new(),
            })
    }

    /// The outcome if the generation has settled.
    pub fn current_outcome(&self) -> Option<ReplyOutcome> {
        if self.completed.is_set() {
            return Some(ReplyOutcome::Completed {
                text: self.assembled_text(),
            });
        }
        if !self.cancel.is_cancelled() {
            return None;
        }
        Some(match self.stop_reason.get() {
            Some(StopReason::Failed(error)) => ReplyOutcome::Failed {
                error: error.clone(),
            },
            Some(StopReason::Aborted(reason)) => ReplyOutcome::Aborted {
                reason: reason.clone(),
            },
            None => ReplyOutcome::Aborted {
                reason: String::new(),
            },
        })
    }
}

/// Reader for a generation's audio: every quick-answer chunk, then every
/// final-answer chunk, each in arrival order.
#[derive(Debug)]
pub struct GenerationAudio {
    quick: Option<mpsc::Receiver<AudioChunk>>,
    final_: mpsc::Receiver<AudioChunk>,
}

impl GenerationAudio {
    /// Next chunk in playback order, or `None` once both segments are closed.
    ///
    /// Cancel-safe: usable as a `tokio::select!` branch.
    pub async fn recv(&mut self) -> Option<AudioChunk> {
        if let Some(quick) = self.quick.as_mut() {
            if let Some(chunk) = quick.recv().await {
                return Some(chunk);
            }
            self.quick = None;
        }
        self.final_.recv().await
    }
}
