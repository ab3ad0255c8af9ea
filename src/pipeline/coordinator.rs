//! Pipeline coordinator: owns the workers and the current generation.
//!
//! [`PipelineCoordinator::start`] spawns four long-lived tasks (the request
//! dispatcher and the three stage workers) around one shared
//! [`PipelineContext`]. Callers feed it `prepare`/`abort` requests and read
//! each reply through a [`ReplyHandle`].

use crate::config::SpeechConfig;
use crate::llm::CompletionEngine;
use crate::pipeline::abort::{self, AbortOutcome};
use crate::pipeline::dispatcher::{self, RequestQueue};
use crate::pipeline::generation::{Generation, GenerationAudio, ReplyOutcome};
use crate::pipeline::history::ConversationHistory;
use crate::pipeline::llm_stage::{self, LlmJob};
use crate::pipeline::messages::{AudioChunk, PipelineRequest};
use crate::pipeline::synthesis_stage::{self, FinalJob, QuickJob};
use crate::runtime::PipelineEvent;
use crate::tts::SynthesisEngine;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_CHANNEL_SIZE: usize = 256;

/// Job senders for the three stage workers.
pub(crate) struct StageSenders {
    pub llm: mpsc::Sender<LlmJob>,
    pub quick: mpsc::Sender<QuickJob>,
    pub final_: mpsc::Sender<FinalJob>,
}

pub(crate) struct StageReceivers {
    llm: mpsc::Receiver<LlmJob>,
    quick: mpsc::Receiver<QuickJob>,
    final_: mpsc::Receiver<FinalJob>,
}

/// State shared by the dispatcher, the abort coordinator and the stage workers.
pub(crate) struct PipelineContext {
    pub config: SpeechConfig,
    pub llm: Arc<dyn CompletionEngine>,
    pub tts: Arc<dyn SynthesisEngine>,
    /// Serializes every write of the current-generation pointer.
    pub decision: tokio::sync::Mutex<()>,
    /// Root shutdown signal observed by every worker.
    pub shutdown: CancellationToken,
    pub requests: RequestQueue,
    pub stages: StageSenders,
    pub replies: mpsc::Sender<ReplyHandle>,
    current: Mutex<Option<Arc<Generation>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<PipelineEvent>,
    history: Mutex<ConversationHistory>,
}

impl PipelineContext {
    pub(crate) fn new(
        config: SpeechConfig,
        llm: Arc<dyn CompletionEngine>,
        tts: Arc<dyn SynthesisEngine>,
    ) -> (Arc<Self>, StageReceivers, mpsc::Receiver<ReplyHandle>) {
        let jobs = config.pipeline.job_channel_capacity.max(1);
        let (llm_tx, llm_rx) = mpsc::channel(jobs);
        let (quick_tx, quick_rx) = mpsc::channel(jobs);
        let (final_tx, final_rx) = mpsc::channel(jobs);
        let (replies_tx, replies_rx) = mpsc::channel(jobs);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let ctx = Arc::new(Self {
            requests: RequestQueue::new(
                config.pipeline.request_queue_capacity,
                config.pipeline.duplicate_window(),
            ),
            history: Mutex::new(ConversationHistory::new(
                config.llm.system_prompt.clone(),
                config.llm.max_history_messages,
            )),
            config,
            llm,
            tts,
            decision: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            stages: StageSenders {
                llm: llm_tx,
                quick: quick_tx,
                final_: final_tx,
            },
            replies: replies_tx,
            current: Mutex::new(None),
            next_id: AtomicU64::new(0),
            events,
        });
        let receivers = StageReceivers {
            llm: llm_rx,
            quick: quick_rx,
            final_: final_rx,
        };
        (ctx, receivers, replies_rx)
    }

    /// Broadcast an event. Having no subscriber is not an error.
    pub(crate) fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn current_generation(&self) -> Option<Arc<Generation>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current generation. Callers hold the decision lock.
    pub(crate) fn set_current(&self, generation: Option<Arc<Generation>>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = generation;
    }

    /// Clear the pointer if it still refers to generation `id`.
    pub(crate) fn clear_current_if(&self, id: u64) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|g| g.id() == id) {
            *current = None;
        }
    }

    pub(crate) fn next_generation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn history(&self) -> MutexGuard<'_, ConversationHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called by every stage as it lets go of a generation. The last stage
    /// out of a generation that was never stopped completes it.
    pub(crate) fn on_stage_exit(&self, generation: &Generation) {
        if !generation.mark_completed() {
            return;
        }
        let text = generation.assembled_text();
        self.history().push_turn(generation.source_text(), &text);
        info!(
            generation = generation.id(),
            elapsed_ms = generation.age().as_millis() as u64,
            "generation completed"
        );
        self.emit(PipelineEvent::GenerationCompleted {
            id: generation.id(),
            text,
        });
    }
}

/// A reply as seen by its consumer: the generation plus its audio.
///
/// Audio stops as soon as the generation starts stopping, so nothing of an
/// interrupted reply is played after the interruption.
#[derive(Debug)]
pub struct ReplyHandle {
    generation: Arc<Generation>,
    audio: GenerationAudio,
}

impl ReplyHandle {
    pub(crate) fn new(generation: Arc<Generation>, audio: GenerationAudio) -> Self {
        Self { generation, audio }
    }

    pub fn id(&self) -> u64 {
        self.generation.id()
    }

    /// The utterance this reply answers.
    pub fn user_text(&self) -> &str {
        self.generation.source_text()
    }

    /// The quick answer, if it has been split off yet.
    pub fn quick_answer(&self) -> Option<&str> {
        self.generation.quick_answer().map(|quick| quick.text.as_str())
    }

    /// Next audio chunk in playback order. `None` once the reply's audio is
    /// complete or the generation stopped.
    ///
    /// Cancel-safe.
    pub async fn next_audio(&mut self) -> Option<AudioChunk> {
        tokio::select! {
            biased;
            () = self.generation.cancel_token().cancelled() => None,
            chunk = self.audio.recv() => chunk,
        }
    }

    /// Wait for the reply to complete or stop.
    pub async fn outcome(&self) -> ReplyOutcome {
        self.generation.outcome().await
    }

    /// Whether the reply was aborted or failed.
    pub fn is_stopped(&self) -> bool {
        self.generation.is_aborting()
    }

    /// Token cancelled when the reply stops.
    pub fn cancel_token(&self) -> &CancellationToken {
        self.generation.cancel_token()
    }
}

/// Activity of one stage for the current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub started: bool,
    pub finished: bool,
}

/// Snapshot of the current generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStatus {
    pub id: u64,
    pub source_text: String,
    pub aborting: bool,
    pub completed: bool,
    pub quick_answer_ready: bool,
    pub llm: StageStatus,
    pub quick_synthesis: StageStatus,
    pub final_synthesis: StageStatus,
    pub age_ms: u64,
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Generation ids issued so far.
    pub generations_started: u64,
    pub current: Option<GenerationStatus>,
    pub pending_requests: usize,
    pub history_messages: usize,
}

/// Handle to a running pipeline.
pub struct PipelineCoordinator {
    ctx: Arc<PipelineContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineCoordinator {
    /// Spawn the dispatcher and stage workers on the current tokio runtime.
    ///
    /// Replies are delivered on the returned receiver, one [`ReplyHandle`]
    /// per generation. Dropping the receiver discards reply audio; the
    /// pipeline keeps running.
    pub fn start(
        config: SpeechConfig,
        llm: Arc<dyn CompletionEngine>,
        tts: Arc<dyn SynthesisEngine>,
    ) -> (Self, mpsc::Receiver<ReplyHandle>) {
        let (ctx, receivers, replies) = PipelineContext::new(config, llm, tts);
        let StageReceivers {
            llm,
            quick,
            final_,
        } = receivers;

        let workers = vec![
            tokio::spawn(dispatcher::run_dispatcher(Arc::clone(&ctx))),
            tokio::spawn(llm_stage::run_llm_stage(Arc::clone(&ctx), llm)),
            tokio::spawn(synthesis_stage::run_quick_stage(Arc::clone(&ctx), quick)),
            tokio::spawn(synthesis_stage::run_final_stage(Arc::clone(&ctx), final_)),
        ];
        info!("speech pipeline started");
        (
            Self {
                ctx,
                workers: Mutex::new(workers),
            },
            replies,
        )
    }

    /// Queue a reply to `text`. Returns `false` if the request was dropped
    /// as a duplicate of one still queued.
    pub fn prepare(&self, text: impl Into<String>) -> bool {
        self.ctx.requests.push(PipelineRequest::prepare(text))
    }

    /// Queue an abort of the current generation.
    pub fn abort(&self, reason: impl Into<String>) {
        self.ctx.requests.push(PipelineRequest::abort(reason));
    }

    /// Abort the current generation now, bypassing the request queue.
    pub async fn interrupt(&self, reason: &str) -> AbortOutcome {
        let decision = self.ctx.decision.lock().await;
        abort::abort_with_timeout(
            &self.ctx,
            &decision,
            reason,
            self.ctx.config.pipeline.abort_timeout(),
        )
        .await
    }

    /// Stop any reply and forget the conversation.
    pub async fn reset(&self) {
        self.interrupt("conversation reset").await;
        self.ctx.history().clear();
        info!("conversation history cleared");
    }

    /// Stop the workers. Idempotent.
    pub async fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if workers.is_empty() {
            return;
        }
        info!("shutting down speech pipeline");
        self.ctx.shutdown.cancel();

        {
            let decision = self.ctx.decision.lock().await;
            abort::abort_with_timeout(
                &self.ctx,
                &decision,
                "pipeline shutdown",
                self.ctx.config.pipeline.shutdown_timeout(),
            )
            .await;
        }

        let join_timeout = self.ctx.config.pipeline.stage_stop_timeout();
        for worker in workers {
            if tokio::time::timeout(join_timeout, worker).await.is_err() {
                warn!("pipeline worker did not stop in time");
            }
        }
        info!("speech pipeline stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.ctx.subscribe()
    }

    pub fn current_generation_id(&self) -> Option<u64> {
        self.ctx.current_generation().map(|g| g.id())
    }

    pub fn config(&self) -> &SpeechConfig {
        &self.ctx.config
    }

    pub fn status(&self) -> PipelineStatus {
        let current = self.ctx.current_generation().map(|g| GenerationStatus {
            id: g.id(),
            source_text: g.source_text().to_owned(),
            aborting: g.is_aborting(),
            completed: g.is_completed(),
            quick_answer_ready: g.is_quick_answer_ready(),
            llm: StageStatus {
                started: g.llm.started.is_set(),
                finished: g.llm.finished.is_set(),
            },
            quick_synthesis: StageStatus {
                started: g.quick_synth.started.is_set(),
                finished: g.quick_synth.finished.is_set(),
            },
            final_synthesis: StageStatus {
                started: g.final_synth.started.is_set(),
                finished: g.final_synth.finished.is_set(),
            },
            age_ms: g.age().as_millis() as u64,
        });
        PipelineStatus {
            generations_started: self.ctx.next_id.load(Ordering::SeqCst),
            current,
            pending_requests: self.ctx.requests.len(),
            history_messages: self.ctx.history().len(),
        }
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
        if let Some(generation) = self.ctx.current_generation() {
            generation.begin_abort("pipeline dropped");
        }
    }
}
