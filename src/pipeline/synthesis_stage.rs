//! Quick-answer and final-answer synthesis stages.
//!
//! Both stages turn text into audio through the shared [`SynthesisEngine`]
//! and push it, smoothed by a per-run [`StreamingAudioBuffer`], into the
//! generation's audio segments. The quick stage speaks one sentence; the
//! final stage speaks the overhang and then batches text pulled from the LLM
//! stage until the stream ends.
//!
//! [`SynthesisEngine`]: crate::tts::SynthesisEngine

use crate::config::FinalAnswerConfig;
use crate::error::Result;
use crate::pipeline::audio_buffer::StreamingAudioBuffer;
use crate::pipeline::coordinator::PipelineContext;
use crate::pipeline::generation::Generation;
use crate::pipeline::messages::AudioChunk;
use crate::runtime::{PipelineEvent, Stage};
use crate::tts::normalize_for_speech;
use futures_util::StreamExt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Work item for the quick-answer stage.
pub(crate) struct QuickJob {
    pub generation: Arc<Generation>,
    pub audio_tx: mpsc::Sender<AudioChunk>,
}

/// Work item for the final-answer stage.
pub(crate) struct FinalJob {
    pub generation: Arc<Generation>,
    /// Text after the quick answer; closed when the LLM stage finishes.
    pub text_rx: mpsc::Receiver<String>,
    pub audio_tx: mpsc::Sender<AudioChunk>,
}

/// How one synthesis run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentEnd {
    Completed,
    Aborted,
    /// Nobody is reading the generation's audio any more.
    ReceiverGone,
}

pub(crate) async fn run_quick_stage(ctx: Arc<PipelineContext>, mut jobs: mpsc::Receiver<QuickJob>) {
    info!("quick-answer stage started");
    loop {
        let job = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        process_quick(&ctx, job).await;
    }
    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        job.generation.quick_synth.finished.set();
    }
    info!("quick-answer stage stopped");
}

pub(crate) async fn run_final_stage(ctx: Arc<PipelineContext>, mut jobs: mpsc::Receiver<FinalJob>) {
    info!("final-answer stage started");
    loop {
        let job = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        process_final(&ctx, job).await;
    }
    jobs.close();
    while let Ok(job) = jobs.try_recv() {
        job.generation.final_synth.finished.set();
    }
    info!("final-answer stage stopped");
}

async fn process_quick(ctx: &PipelineContext, job: QuickJob) {
    let QuickJob {
        generation,
        audio_tx,
    } = job;
    let id = generation.id();
    if generation.is_aborting() {
        generation.quick_synth.finished.set();
        return;
    }
    generation.quick_synth.started.set();

    let text = generation
        .quick_answer()
        .map(|quick| quick.text.clone())
        .unwrap_or_default();
    match synthesize_segment(ctx, &generation, &text, &audio_tx).await {
        Ok(end) => debug!(generation = id, ?end, "quick answer synthesized"),
        Err(e) => stage_failed(ctx, &generation, Stage::QuickSynthesis, &e.to_string()),
    }

    // Closing the quick segment lets the reader move on to the final one.
    drop(audio_tx);
    generation.quick_synth.finished.set();
    ctx.on_stage_exit(&generation);
}

async fn process_final(ctx: &PipelineContext, job: FinalJob) {
    let FinalJob {
        generation,
        mut text_rx,
        audio_tx,
    } = job;
    if generation.is_aborting() {
        generation.final_synth.finished.set();
        return;
    }
    generation.final_synth.started.set();

    if let Err(e) = speak_final_answer(ctx, &generation, &mut text_rx, audio_tx).await {
        stage_failed(ctx, &generation, Stage::FinalSynthesis, &e.to_string());
    }

    drop(text_rx);
    generation.final_synth.finished.set();
    ctx.on_stage_exit(&generation);
}

/// Speak the overhang, then pull and speak the rest of the reply.
///
/// Every pulled chunk is appended to the generation's final answer, even
/// after the audio reader went away, so the assembled text stays complete.
async fn speak_final_answer(
    ctx: &PipelineContext,
    generation: &Generation,
    text_rx: &mut mpsc::Receiver<String>,
    audio_tx: mpsc::Sender<AudioChunk>,
) -> Result<()> {
    let id = generation.id();
    let cancel = generation.cancel_token();
    let mut audio_tx = Some(audio_tx);

    let overhang = generation
        .quick_answer()
        .map(|quick| quick.overhang.clone())
        .unwrap_or_default();
    if flush(ctx, generation, &overhang, &mut audio_tx).await? == SegmentEnd::Aborted {
        return Ok(());
    }

    let mut pending = String::new();
    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(generation = id, "final-answer stage observed abort");
                return Ok(());
            }
            chunk = text_rx.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        generation.append_final_answer(&chunk);
        pending.push_str(&chunk);
        if should_flush(&pending, &chunk, &ctx.config.final_answer) {
            let text = std::mem::take(&mut pending);
            if flush(ctx, generation, &text, &mut audio_tx).await? == SegmentEnd::Aborted {
                return Ok(());
            }
        }
    }

    flush(ctx, generation, &pending, &mut audio_tx).await?;
    Ok(())
}

/// Synthesize `text` unless the audio reader is already gone.
async fn flush(
    ctx: &PipelineContext,
    generation: &Generation,
    text: &str,
    audio_tx: &mut Option<mpsc::Sender<AudioChunk>>,
) -> Result<SegmentEnd> {
    let Some(tx) = audio_tx.as_ref() else {
        return Ok(SegmentEnd::ReceiverGone);
    };
    let end = synthesize_segment(ctx, generation, text, tx).await?;
    if end == SegmentEnd::ReceiverGone {
        debug!(generation = generation.id(), "audio reader gone, muting final answer");
        *audio_tx = None;
    }
    Ok(end)
}

/// Batch boundary for final-answer text: a long enough backlog, or a chunk
/// carrying sentence punctuation.
fn should_flush(pending: &str, chunk: &str, config: &FinalAnswerConfig) -> bool {
    pending.chars().count() > config.flush_chars
        || chunk.chars().any(|c| config.flush_punctuation.contains(&c))
}

/// Synthesize one span of text into `audio_tx`.
async fn synthesize_segment(
    ctx: &PipelineContext,
    generation: &Generation,
    text: &str,
    audio_tx: &mpsc::Sender<AudioChunk>,
) -> Result<SegmentEnd> {
    let speech = normalize_for_speech(text);
    if speech.trim().is_empty() {
        return Ok(SegmentEnd::Completed);
    }
    let cancel = generation.cancel_token();

    let mut stream = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(SegmentEnd::Aborted),
        stream = ctx.tts.synthesize(speech.trim()) => stream?,
    };

    let mut buffer = StreamingAudioBuffer::new(&ctx.config.audio_buffer);
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(SegmentEnd::Aborted),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        for ready in buffer.push(chunk?, Instant::now()) {
            if let ControlFlow::Break(end) = forward(cancel, audio_tx, ready).await {
                return Ok(end);
            }
        }
    }
    for ready in buffer.finish() {
        if let ControlFlow::Break(end) = forward(cancel, audio_tx, ready).await {
            return Ok(end);
        }
    }
    Ok(SegmentEnd::Completed)
}

async fn forward(
    cancel: &CancellationToken,
    audio_tx: &mpsc::Sender<AudioChunk>,
    chunk: AudioChunk,
) -> ControlFlow<SegmentEnd> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => ControlFlow::Break(SegmentEnd::Aborted),
        sent = audio_tx.send(chunk) => match sent {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(SegmentEnd::ReceiverGone),
        },
    }
}

fn stage_failed(ctx: &PipelineContext, generation: &Generation, stage: Stage, error: &str) {
    let id = generation.id();
    if generation.is_aborting() {
        debug!(generation = id, %stage, "synthesis error after abort: {error}");
        return;
    }
    warn!(generation = id, %stage, "synthesis failed: {error}");
    ctx.emit(PipelineEvent::GenerationFailed {
        id,
        stage,
        error: error.to_owned(),
    });
    generation.fail(error);
}
