//! Request dispatcher: the single consumer of `prepare`/`abort` requests.
//!
//! Bursts of requests (partial transcripts updating every few tokens) are
//! coalesced to the most recent one before any decision is made. Every
//! decision runs under the coordinator's decision lock, which it shares with
//! the abort coordinator, so the current-generation pointer has exactly one
//! writer at a time.

use crate::pipeline::abort::{self, DecisionGuard};
use crate::pipeline::coordinator::{PipelineContext, ReplyHandle};
use crate::pipeline::generation::{ChannelSizes, Generation};
use crate::pipeline::llm_stage::LlmJob;
use crate::pipeline::messages::{PipelineRequest, RequestKind};
use crate::pipeline::similarity::tail_similarity;
use crate::runtime::{IgnoreReason, PipelineEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Arrival-ordered request queue with duplicate suppression.
#[derive(Debug)]
pub(crate) struct RequestQueue {
    requests: Mutex<VecDeque<PipelineRequest>>,
    notify: Notify,
    capacity: usize,
    duplicate_window: Duration,
}

impl RequestQueue {
    pub(crate) fn new(capacity: usize, duplicate_window: Duration) -> Self {
        Self {
            requests: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            duplicate_window,
        }
    }

    /// Queue a request. Returns `false` if a `prepare` was dropped because an
    /// unconsumed `prepare` with the same text arrived within the debounce window.
    pub(crate) fn push(&self, request: PipelineRequest) -> bool {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(text) = request.prepare_text() {
            let duplicate = requests.iter().any(|queued| {
                queued.prepare_text() == Some(text)
                    && request.received_at.saturating_duration_since(queued.received_at)
                        < self.duplicate_window
            });
            if duplicate {
                return false;
            }
        }
        if requests.len() >= self.capacity {
            // Only the newest request matters once the dispatcher catches up.
            requests.pop_front();
        }
        requests.push_back(request);
        drop(requests);
        self.notify.notify_one();
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn drain(&self) -> Vec<PipelineRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Wait for at least one request and take everything queued.
    async fn next_batch(&self) -> Vec<PipelineRequest> {
        loop {
            let batch = self.drain();
            if !batch.is_empty() {
                return batch;
            }
            self.notify.notified().await;
        }
    }
}

/// What remains of a batch after coalescing.
#[derive(Debug, PartialEq, Eq)]
struct Coalesced {
    latest: RequestKind,
    received_at: Instant,
    /// An abort was skipped in favour of a newer request.
    abort_pending: bool,
}

fn coalesce(batch: Vec<PipelineRequest>) -> Option<Coalesced> {
    let skipped = batch.len().saturating_sub(1);
    let mut abort_pending = false;
    let mut latest = None;
    for (index, request) in batch.into_iter().enumerate() {
        if index < skipped {
            debug!(kind = ?request.kind, "skipping older request");
            abort_pending |= matches!(request.kind, RequestKind::Abort(_));
        } else {
            latest = Some(request);
        }
    }
    latest.map(|request| Coalesced {
        latest: request.kind,
        received_at: request.received_at,
        abort_pending,
    })
}

/// Run the dispatcher until the pipeline shuts down.
pub(crate) async fn run_dispatcher(ctx: Arc<PipelineContext>) {
    info!("request dispatcher started");
    let mut previous_prepare: Option<(String, Instant)> = None;

    loop {
        let batch = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            batch = ctx.requests.next_batch() => batch,
        };
        let Some(request) = coalesce(batch) else {
            continue;
        };

        match request.latest {
            RequestKind::Prepare(text) => {
                if let Some((previous, at)) = &previous_prepare
                    && *previous == text
                    && request.received_at.saturating_duration_since(*at)
                        < ctx.config.pipeline.duplicate_window()
                {
                    info!("skipping duplicate prepare request");
                    ctx.emit(PipelineEvent::RequestIgnored {
                        reason: IgnoreReason::Duplicate,
                        text,
                    });
                    continue;
                }

                let decision = ctx.decision.lock().await;
                if request.abort_pending {
                    abort::abort_with_timeout(
                        &ctx,
                        &decision,
                        "abort requested",
                        ctx.config.pipeline.abort_timeout(),
                    )
                    .await;
                }
                handle_prepare(&ctx, &decision, &text).await;
                drop(decision);
                previous_prepare = Some((text, request.received_at));
            }
            RequestKind::Abort(reason) => {
                let decision = ctx.decision.lock().await;
                abort::abort_with_timeout(
                    &ctx,
                    &decision,
                    &reason,
                    ctx.config.pipeline.abort_timeout(),
                )
                .await;
            }
        }
    }
    info!("request dispatcher stopped");
}

/// Decide whether `text` replaces the current generation, and start it if so.
async fn handle_prepare(ctx: &Arc<PipelineContext>, decision: &DecisionGuard<'_>, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        ctx.emit(PipelineEvent::RequestIgnored {
            reason: IgnoreReason::Empty,
            text: text.to_owned(),
        });
        return;
    }

    if let Some(current) = ctx.current_generation()
        && !current.is_aborting()
    {
        let similarity = tail_similarity(
            current.source_text(),
            text,
            ctx.config.pipeline.similarity_tail_words,
        );
        if similarity >= ctx.config.pipeline.similarity_threshold {
            info!(
                generation = current.id(),
                similarity,
                "too similar to current generation, ignoring"
            );
            ctx.emit(PipelineEvent::RequestIgnored {
                reason: IgnoreReason::TooSimilar,
                text: text.to_owned(),
            });
            return;
        }
        info!(
            generation = current.id(),
            similarity,
            "different enough, replacing current generation"
        );
        abort::abort_with_timeout(
            ctx,
            decision,
            "superseded by new utterance",
            ctx.config.pipeline.abort_timeout(),
        )
        .await;
    }

    start_generation(ctx, decision, text).await;
}

/// Create the next generation, make it current and hand it to the LLM stage.
///
/// No engine I/O happens here: the completion stream is opened by the LLM
/// stage, where an abort can reach it.
async fn start_generation(ctx: &Arc<PipelineContext>, _decision: &DecisionGuard<'_>, text: &str) {
    let id = ctx.next_generation_id();
    let request = ctx.history().request_for(text);

    let sizes = ChannelSizes {
        final_text: ctx.config.pipeline.final_text_channel_capacity,
        audio: ctx.config.pipeline.audio_channel_capacity,
    };
    let (generation, channels, audio) = Generation::new(id, text, sizes);
    ctx.set_current(Some(Arc::clone(&generation)));
    info!(generation = id, "generation started: {text}");
    ctx.emit(PipelineEvent::GenerationStarted {
        id,
        source_text: text.to_owned(),
    });

    if let Err(e) = ctx.replies.try_send(ReplyHandle::new(Arc::clone(&generation), audio)) {
        warn!(generation = id, "no reply consumer, audio will be discarded: {e}");
    }

    generation.llm.started.set();
    let job = LlmJob {
        generation: Arc::clone(&generation),
        request,
        channels,
    };
    let delivered = tokio::select! {
        () = ctx.shutdown.cancelled() => false,
        sent = ctx.stages.llm.send(job) => sent.is_ok(),
    };
    if !delivered {
        warn!(generation = id, "LLM stage unavailable, generation will not run");
        generation.fail("LLM stage unavailable");
        generation.mark_stages_finished();
        ctx.clear_current_if(id);
    }
}
