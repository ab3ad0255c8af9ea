//! One client connection: its own pipeline, transcription and reply stream.
//!
//! Engines are shared between sessions; conversation history, the current
//! generation and the inbound audio queue are not.

use crate::audio::input_queue::AudioInputQueue;
use crate::config::SpeechConfig;
use crate::error::Result;
use crate::llm::CompletionEngine;
use crate::pipeline::coordinator::{PipelineCoordinator, ReplyHandle};
use crate::pipeline::generation::ReplyOutcome;
use crate::stt::{TranscriptEvent, TranscriptionEngine, TranscriptionSink, run_transcription_stage};
use crate::transport::{ClientMessage, ServerMessage, parse_audio_frame};
use crate::tts::SynthesisEngine;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds a fresh transcription engine for each connection.
pub type TranscriberFactory =
    Arc<dyn Fn() -> Result<Box<dyn TranscriptionEngine>> + Send + Sync>;

/// Engines handed to every new session.
#[derive(Clone)]
pub struct SessionEngines {
    pub llm: Arc<dyn CompletionEngine>,
    pub tts: Arc<dyn SynthesisEngine>,
    /// `None` ignores inbound audio; only typed input is answered.
    pub transcriber: Option<TranscriberFactory>,
}

struct Shared {
    id: String,
    pipeline: PipelineCoordinator,
    outbound: mpsc::Sender<ServerMessage>,
    /// Set between the client's `tts_start` and `tts_stop`.
    client_playing: AtomicBool,
    /// Cut signal of the reply being streamed, if any.
    streaming: Mutex<Option<CancellationToken>>,
}

impl Shared {
    async fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!(session = %self.id, "outbound queue closed, dropping message");
        }
    }

    /// Stop playback on the client and abort the current generation.
    ///
    /// The reply stream, if one is running, sends the `stop_tts` /
    /// `tts_interruption` pair itself; otherwise it is sent from here.
    async fn cut_reply(&self, reason: &str) {
        let streaming = {
            let slot = self.streaming.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(cut) => {
                    cut.cancel();
                    true
                }
                None => false,
            }
        };
        if !streaming {
            self.send(ServerMessage::StopTts).await;
        }
        let outcome = self.pipeline.interrupt(reason).await;
        self.client_playing.store(false, Ordering::SeqCst);
        if !streaming {
            self.send(ServerMessage::TtsInterruption).await;
        }
        info!(session = %self.id, ?outcome, "reply interrupted: {reason}");
    }

    /// Forward one reply to the client.
    ///
    /// Sends `final_user_request`, the quick answer ahead of the first audio
    /// chunk, the audio, and then exactly one of `final_assistant_answer` or
    /// the interruption pair.
    async fn stream_reply(&self, mut reply: ReplyHandle, closing: &CancellationToken) {
        let cut = CancellationToken::new();
        *self.streaming.lock().unwrap_or_else(PoisonError::into_inner) = Some(cut.clone());
        let id = reply.id();
        debug!(session = %self.id, generation = id, "streaming reply");

        self.send(ServerMessage::FinalUserRequest(reply.user_text().to_owned()))
            .await;

        let mut announced = false;
        let mut chunks = 0usize;
        loop {
            let chunk = tokio::select! {
                biased;
                () = closing.cancelled() => return,
                () = cut.cancelled() => None,
                chunk = reply.next_audio() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            if !announced {
                if let Some(quick) = reply.quick_answer() {
                    self.send(ServerMessage::PartialAssistantAnswer(quick.to_owned()))
                        .await;
                }
                announced = true;
            }
            self.send(ServerMessage::tts_chunk(&chunk)).await;
            chunks += 1;
        }

        let outcome = tokio::select! {
            biased;
            () = closing.cancelled() => return,
            () = cut.cancelled() => None,
            outcome = reply.outcome() => Some(outcome),
        };
        let was_cut = {
            let mut slot = self.streaming.lock().unwrap_or_else(PoisonError::into_inner);
            *slot = None;
            cut.is_cancelled()
        };

        match outcome {
            Some(ReplyOutcome::Completed { text }) if !was_cut => {
                debug!(session = %self.id, generation = id, chunks, "reply delivered");
                self.send(ServerMessage::final_answer(&text)).await;
            }
            outcome => {
                debug!(session = %self.id, generation = id, chunks, ?outcome, "reply cut off");
                self.send(ServerMessage::StopTts).await;
                self.send(ServerMessage::TtsInterruption).await;
            }
        }
    }
}

#[async_trait]
impl TranscriptionSink for Shared {
    async fn on_transcript(&self, event: TranscriptEvent) {
        match event {
            TranscriptEvent::SpeechStart => {
                if self.client_playing.load(Ordering::SeqCst) {
                    self.cut_reply("user started speaking").await;
                }
            }
            TranscriptEvent::Partial(text) => {
                self.send(ServerMessage::PartialUserRequest(text)).await;
            }
            TranscriptEvent::Final(text) => {
                if !self.pipeline.prepare(text) {
                    debug!(session = %self.id, "duplicate utterance dropped");
                }
            }
        }
    }
}

async fn run_replies(
    shared: Arc<Shared>,
    mut replies: mpsc::Receiver<ReplyHandle>,
    closing: CancellationToken,
) {
    loop {
        let reply = tokio::select! {
            () = closing.cancelled() => break,
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
        };
        shared.stream_reply(reply, &closing).await;
    }
}

/// A connected client.
pub struct Session {
    shared: Arc<Shared>,
    audio_in: Option<Arc<AudioInputQueue>>,
    closing: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Start a pipeline for a new connection and greet the client with
    /// `session_info`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transcription engine cannot be created.
    pub async fn start(
        config: SpeechConfig,
        engines: &SessionEngines,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<Self> {
        let transcriber = engines.transcriber.as_ref().map(|factory| factory()).transpose()?;
        let id = uuid::Uuid::new_v4().to_string();
        let sample_rate = engines.tts.sample_rate();
        let audio_in = transcriber
            .is_some()
            .then(|| Arc::new(AudioInputQueue::new(&config.audio_input)));

        let (pipeline, replies) =
            PipelineCoordinator::start(config, Arc::clone(&engines.llm), Arc::clone(&engines.tts));
        let shared = Arc::new(Shared {
            id: id.clone(),
            pipeline,
            outbound,
            client_playing: AtomicBool::new(false),
            streaming: Mutex::new(None),
        });
        shared
            .send(ServerMessage::SessionInfo {
                session_id: id.clone(),
                status: "connected".to_owned(),
                sample_rate,
            })
            .await;

        let closing = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(run_replies(
            Arc::clone(&shared),
            replies,
            closing.clone(),
        ))];
        if let (Some(engine), Some(queue)) = (transcriber, audio_in.as_ref()) {
            tasks.push(tokio::spawn(run_transcription_stage(
                engine,
                Arc::clone(queue),
                Arc::clone(&shared) as Arc<dyn TranscriptionSink>,
                closing.clone(),
            )));
        }

        info!(session = %id, transcription = audio_in.is_some(), "session started");
        Ok(Self {
            shared,
            audio_in,
            closing,
            tasks,
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn pipeline(&self) -> &PipelineCoordinator {
        &self.shared.pipeline
    }

    /// Handle a JSON text frame. Malformed frames are answered with an
    /// `error` message.
    pub async fn handle_text(&self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!(session = %self.id(), "{e}");
                self.shared.send(ServerMessage::Error(e.to_string())).await;
            }
        }
    }

    pub async fn handle_message(&self, message: ClientMessage) {
        debug!(session = %self.id(), ?message, "client message");
        match message {
            ClientMessage::UserText { content } => {
                self.shared
                    .on_transcript(TranscriptEvent::Final(content))
                    .await;
            }
            ClientMessage::Abort { reason } => {
                self.shared
                    .pipeline
                    .abort(reason.unwrap_or_else(|| "client abort".to_owned()));
            }
            ClientMessage::Stop => self.shared.cut_reply("client stop").await,
            ClientMessage::ClearHistory => self.shared.pipeline.reset().await,
            ClientMessage::Ping => self.shared.send(ServerMessage::Pong).await,
            ClientMessage::TtsStart => self.shared.client_playing.store(true, Ordering::SeqCst),
            ClientMessage::TtsStop => self.shared.client_playing.store(false, Ordering::SeqCst),
            ClientMessage::Unknown => {}
        }
    }

    /// Queue a binary audio frame for transcription.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame header is malformed.
    pub fn handle_audio(&self, raw: Bytes) -> Result<()> {
        let frame = parse_audio_frame(raw)?;
        match &self.audio_in {
            Some(queue) => {
                queue.push(frame);
            }
            None => debug!(session = %self.id(), "transcription disabled, audio frame dropped"),
        }
        Ok(())
    }

    /// Stop transcription, the reply stream and the pipeline.
    pub async fn close(mut self) {
        self.closing.cancel();
        self.shared.pipeline.shutdown().await;
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!(session = %self.shared.id, "session task failed: {e}");
            }
        }
        info!(session = %self.shared.id, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}
