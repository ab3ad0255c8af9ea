//! Abort coordinator: bounded-time, cooperative cancellation of a generation.
//!
//! Cancelling the generation's token is the single stop signal; each stage
//! observes it at its next suspension point. The coordinator then waits on
//! every stage that may be active, closes engine handles best-effort, and
//! clears the current-generation pointer. No step blocks indefinitely.

use crate::pipeline::coordinator::PipelineContext;
use crate::pipeline::generation::{Generation, Latch};
use crate::runtime::{PipelineEvent, Stage};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Held while writing the current-generation pointer. Only the dispatcher and
/// the abort coordinator hold it, never at the same time.
pub(crate) type DecisionGuard<'a> = tokio::sync::MutexGuard<'a, ()>;

/// What an abort invocation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// There was no current generation.
    NoGeneration,
    /// The current generation was already stopping.
    AlreadyAborting,
    /// The current generation had completed; it was retired without an abort.
    Retired(u64),
    /// The generation was stopped and every stage accounted for.
    Aborted(u64),
    /// The overall deadline passed; the pointer was cleared anyway.
    TimedOut(u64),
}

/// Abort the current generation, giving up after `timeout`.
///
/// On timeout the pointer is cleared and every stage flag forced, so the
/// caller can always proceed.
pub(crate) async fn abort_with_timeout(
    ctx: &PipelineContext,
    decision: &DecisionGuard<'_>,
    reason: &str,
    timeout: Duration,
) -> AbortOutcome {
    let target = ctx.current_generation();
    match tokio::time::timeout(timeout, abort_current(ctx, decision, reason)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            let Some(generation) = target else {
                return AbortOutcome::NoGeneration;
            };
            warn!(
                generation = generation.id(),
                timeout_ms = timeout.as_millis() as u64,
                "abort did not complete in time, clearing generation"
            );
            generation.mark_stages_finished();
            ctx.clear_current_if(generation.id());
            ctx.emit(PipelineEvent::GenerationAborted {
                id: generation.id(),
                reason: reason.to_owned(),
            });
            AbortOutcome::TimedOut(generation.id())
        }
    }
}

/// Abort the current generation.
pub(crate) async fn abort_current(
    ctx: &PipelineContext,
    _decision: &DecisionGuard<'_>,
    reason: &str,
) -> AbortOutcome {
    let Some(generation) = ctx.current_generation() else {
        debug!("no active generation to abort");
        return AbortOutcome::NoGeneration;
    };
    let id = generation.id();

    if generation.is_completed() {
        generation.begin_abort(reason);
        ctx.clear_current_if(id);
        debug!(generation = id, "retired completed generation");
        return AbortOutcome::Retired(id);
    }
    if !generation.begin_abort(reason) {
        info!(generation = id, "generation already aborting");
        return AbortOutcome::AlreadyAborting;
    }

    info!(generation = id, reason, "aborting generation");
    let started = Instant::now();
    let stage_timeout = ctx.config.pipeline.stage_stop_timeout();

    if generation.llm.started.is_set() {
        wait_for_stage(&generation, Stage::Llm, &generation.llm.finished, stage_timeout).await;
    }
    if generation.is_quick_answer_ready() || generation.quick_synth.started.is_set() {
        wait_for_stage(
            &generation,
            Stage::QuickSynthesis,
            &generation.quick_synth.finished,
            stage_timeout,
        )
        .await;
    }
    if generation.is_quick_answer_ready() || generation.final_synth.started.is_set() {
        wait_for_stage(
            &generation,
            Stage::FinalSynthesis,
            &generation.final_synth.finished,
            stage_timeout,
        )
        .await;
    }

    close_engine_handles(ctx, &generation).await;

    ctx.clear_current_if(id);
    generation.mark_stages_finished();
    ctx.emit(PipelineEvent::GenerationAborted {
        id,
        reason: reason.to_owned(),
    });
    info!(
        generation = id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "abort complete"
    );
    AbortOutcome::Aborted(id)
}

async fn wait_for_stage(
    generation: &Generation,
    stage: Stage,
    finished: &Latch,
    timeout: Duration,
) {
    if !finished.wait_timeout(timeout).await {
        warn!(
            generation = generation.id(),
            %stage,
            timeout_ms = timeout.as_millis() as u64,
            "stage did not stop in time, proceeding"
        );
    }
}

/// Release engine resources held for `generation`. Failures are logged only.
async fn close_engine_handles(ctx: &PipelineContext, generation: &Generation) {
    if let Err(e) = ctx.llm.cancel().await {
        warn!(generation = generation.id(), "completion cancel failed: {e}");
    }
    if (generation.quick_synth.started.is_set() || generation.final_synth.started.is_set())
        && let Err(e) = ctx.tts.stop().await
    {
        warn!(generation = generation.id(), "synthesis stop failed: {e}");
    }
}
