//! LLM stage: opens and consumes a generation's token stream.
//!
//! The completion request is sent from here rather than from the dispatcher,
//! so an abort can cut a slow engine start short without waiting on it.
//! Tokens accumulate until the boundary detector finds the end of the first
//! sentence. That prefix becomes the quick answer and is handed to the quick
//! synthesis stage right away; everything after it is forwarded to the
//! final-answer stage as it arrives.

use crate::llm::{CompletionRequest, TokenStream};
use crate::pipeline::boundary::split_quick_answer;
use crate::pipeline::coordinator::PipelineContext;
use crate::pipeline::generation::{Generation, GenerationChannels};
use crate::pipeline::messages::AudioChunk;
use crate::pipeline::synthesis_stage::{FinalJob, QuickJob};
use crate::runtime::{PipelineEvent, Stage};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Work item for the LLM stage.
pub(crate) struct LlmJob {
    pub generation: Arc<Generation>,
    pub request: CompletionRequest,
    pub channels: GenerationChannels,
}

/// Channel ends still owed to the synthesis stages. Handed over when the
/// quick answer is published.
struct Downstream {
    final_text_rx: mpsc::Receiver<String>,
    quick_audio_tx: mpsc::Sender<AudioChunk>,
    final_audio_tx: mpsc::Sender<AudioChunk>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Dispatched {
    quick: bool,
    final_: bool,
}

/// Run the LLM worker until the pipeline shuts down.
pub(crate) async fn run_llm_stage(ctx: Arc<PipelineContext>, mut jobs: mpsc::Receiver<LlmJob>) {
    info!("LLM stage started");
    loop {
        let job = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        process_job(&ctx, job).await;
    }
    // Generations still queued will never run; release their waiters.
    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        job.generation.mark_stages_finished();
    }
    info!("LLM stage stopped");
}

async fn process_job(ctx: &PipelineContext, job: LlmJob) {
    let LlmJob {
        generation,
        request,
        channels,
    } = job;
    let GenerationChannels {
        final_text_tx,
        final_text_rx,
        quick_audio_tx,
        final_audio_tx,
    } = channels;
    let mut downstream = Some(Downstream {
        final_text_rx,
        quick_audio_tx,
        final_audio_tx,
    });
    let mut dispatched = Dispatched::default();

    let mut open_failed = false;
    match open_stream(ctx, &generation, request).await {
        Opened::Stream(stream) => {
            consume_tokens(
                ctx,
                &generation,
                stream,
                &final_text_tx,
                &mut downstream,
                &mut dispatched,
            )
            .await;
        }
        Opened::Failed => open_failed = true,
        Opened::Stopped => {
            debug!(generation = generation.id(), "generation stopped before its stream opened");
        }
    }

    drop(final_text_tx);
    drop(downstream);
    generation.llm.finished.set();
    if !dispatched.quick {
        generation.quick_synth.finished.set();
    }
    if !dispatched.final_ {
        generation.final_synth.finished.set();
    }
    ctx.on_stage_exit(&generation);

    if open_failed {
        // Every stage flag is set by now, so an abort holding the lock cannot
        // be waiting on this worker.
        let decision = tokio::select! {
            () = ctx.shutdown.cancelled() => None,
            guard = ctx.decision.lock() => Some(guard),
        };
        ctx.clear_current_if(generation.id());
        drop(decision);
    }
}

enum Opened {
    Stream(TokenStream),
    /// The engine refused the request; the generation has been failed.
    Failed,
    /// The generation stopped first.
    Stopped,
}

/// Start the completion, giving up as soon as the generation stops.
async fn open_stream(
    ctx: &PipelineContext,
    generation: &Generation,
    request: CompletionRequest,
) -> Opened {
    let id = generation.id();
    if generation.is_aborting() {
        return Opened::Stopped;
    }
    let started = tokio::select! {
        biased;
        () = generation.cancel_token().cancelled() => return Opened::Stopped,
        started = ctx.llm.stream_completion(request) => started,
    };
    match started {
        // Dropping a stream opened just as the abort landed closes it.
        Ok(_) if generation.is_aborting() => Opened::Stopped,
        Ok(stream) => Opened::Stream(stream),
        Err(e) => {
            error!(generation = id, "failed to start completion: {e}");
            if generation.fail(&e.to_string()) {
                ctx.emit(PipelineEvent::GenerationFailed {
                    id,
                    stage: Stage::Llm,
                    error: e.to_string(),
                });
            }
            Opened::Failed
        }
    }
}

async fn consume_tokens(
    ctx: &PipelineContext,
    generation: &Arc<Generation>,
    mut stream: TokenStream,
    final_text_tx: &mpsc::Sender<String>,
    downstream: &mut Option<Downstream>,
    dispatched: &mut Dispatched,
) {
    let id = generation.id();
    let cancel = generation.cancel_token();
    let mut accumulated = String::new();
    let mut forward_open = true;
    let mut tokens = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(generation = id, tokens, "LLM stage observed abort");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(token)) => {
                tokens += 1;
                if generation.is_quick_answer_ready() {
                    if forward_open {
                        let sent = tokio::select! {
                            biased;
                            () = cancel.cancelled() => return,
                            sent = final_text_tx.send(token) => sent,
                        };
                        if sent.is_err() {
                            debug!(generation = id, "final-answer stage stopped pulling text");
                            forward_open = false;
                        }
                    }
                    continue;
                }

                accumulated.push_str(&token);
                let split = split_quick_answer(&accumulated, &ctx.config.boundary)
                    .map(|(quick, overhang)| (quick.to_owned(), overhang.to_owned()));
                if let Some((quick, overhang)) = split {
                    publish_quick(ctx, generation, quick, overhang, downstream, dispatched).await;
                }
            }
            Some(Err(e)) => {
                warn!(generation = id, "token stream failed: {e}");
                ctx.emit(PipelineEvent::GenerationFailed {
                    id,
                    stage: Stage::Llm,
                    error: e.to_string(),
                });
                generation.fail(&e.to_string());
                return;
            }
            None => {
                // Short replies never reach a boundary: speak them whole.
                if !generation.is_quick_answer_ready() && !accumulated.trim().is_empty() {
                    publish_quick(
                        ctx,
                        generation,
                        std::mem::take(&mut accumulated),
                        String::new(),
                        downstream,
                        dispatched,
                    )
                    .await;
                }
                debug!(generation = id, tokens, "token stream complete");
                return;
            }
        }
    }
}

/// Record the quick answer and hand work to both synthesis stages.
async fn publish_quick(
    ctx: &PipelineContext,
    generation: &Arc<Generation>,
    quick: String,
    overhang: String,
    downstream: &mut Option<Downstream>,
    dispatched: &mut Dispatched,
) {
    let id = generation.id();
    if generation.is_aborting() {
        return;
    }
    let Some(Downstream {
        final_text_rx,
        quick_audio_tx,
        final_audio_tx,
    }) = downstream.take()
    else {
        return;
    };
    if !generation.set_quick_answer(quick.clone(), overhang) {
        return;
    }
    info!(generation = id, "quick answer ready: {quick}");
    ctx.emit(PipelineEvent::QuickAnswerReady { id, text: quick });

    let cancel = generation.cancel_token();
    let quick_job = QuickJob {
        generation: Arc::clone(generation),
        audio_tx: quick_audio_tx,
    };
    dispatched.quick = tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = ctx.stages.quick.send(quick_job) => sent.is_ok(),
    };

    let final_job = FinalJob {
        generation: Arc::clone(generation),
        text_rx: final_text_rx,
        audio_tx: final_audio_tx,
    };
    dispatched.final_ = tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = ctx.stages.final_.send(final_job) => sent.is_ok(),
    };

    if !(dispatched.quick && dispatched.final_) && !generation.is_aborting() {
        warn!(generation = id, "synthesis stage unavailable");
    }
}
