//! Shared fakes and helpers for integration tests.

use async_trait::async_trait;
use cadence::config::SpeechConfig;
use cadence::llm::{CompletionEngine, CompletionRequest, TokenStream};
use cadence::pipeline::messages::AudioChunk;
use cadence::tts::{AudioStream, SynthesisEngine};
use cadence::{PipelineCoordinator, PipelineEvent, ReplyHandle, Result};
use futures_util::{StreamExt, stream};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub(crate) const WAIT: Duration = Duration::from_secs(5);
pub(crate) const SAMPLE_RATE: u32 = 24_000;

/// One scripted completion.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Yield these tokens, then end.
    Tokens(Vec<&'static str>),
    /// Yield these tokens, then stall until dropped.
    Hang(Vec<&'static str>),
}

/// Completion engine replaying [`Reply`] scripts in order, then a fallback.
pub(crate) struct FakeLlm {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    prompts: Mutex<Vec<CompletionRequest>>,
    cancels: AtomicUsize,
}

impl FakeLlm {
    pub(crate) fn new(replies: Vec<Reply>, fallback: Reply) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback,
            prompts: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
        }
    }

    pub(crate) fn always(reply: Reply) -> Self {
        Self::new(Vec::new(), reply)
    }

    pub(crate) fn prompts(&self) -> Vec<CompletionRequest> {
        self.prompts.lock().unwrap().clone()
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionEngine for FakeLlm {
    async fn stream_completion(&self, request: CompletionRequest) -> Result<TokenStream> {
        self.prompts.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let (tokens, hang) = match reply {
            Reply::Tokens(tokens) => (tokens, false),
            Reply::Hang(tokens) => (tokens, true),
        };
        let tokens = stream::iter(tokens.into_iter().map(|t| Ok(t.to_owned())));
        if hang {
            Ok(tokens.chain(stream::pending::<Result<String>>()).boxed())
        } else {
            Ok(tokens.boxed())
        }
    }

    async fn cancel(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Synthesis engine emitting `chunks` chunks per call, each filled with the
/// byte length of the text, optionally paced by `delay`.
pub(crate) struct FakeTts {
    chunks: usize,
    delay: Duration,
    texts: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl FakeTts {
    pub(crate) fn new(chunks: usize) -> Self {
        Self {
            chunks,
            delay: Duration::ZERO,
            texts: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }
    }

    pub(crate) fn paced(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisEngine for FakeTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.texts.lock().unwrap().push(text.to_owned());
        let value = i16::try_from(text.len()).unwrap_or(i16::MAX);
        let (chunks, delay) = (self.chunks, self.delay);
        Ok(Box::pin(async_stream::stream! {
            for _ in 0..chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(AudioChunk::new(vec![value; 240], SAMPLE_RATE));
            }
        }))
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

/// A running pipeline plus handles on its fakes.
pub(crate) struct Harness {
    pub pipeline: PipelineCoordinator,
    pub replies: mpsc::Receiver<ReplyHandle>,
    pub events: broadcast::Receiver<PipelineEvent>,
    pub llm: Arc<FakeLlm>,
    pub tts: Arc<FakeTts>,
}

pub(crate) fn start_pipeline(llm: FakeLlm, tts: FakeTts) -> Harness {
    let llm = Arc::new(llm);
    let tts = Arc::new(tts);
    let (pipeline, replies) = PipelineCoordinator::start(
        SpeechConfig::default(),
        Arc::clone(&llm) as Arc<dyn CompletionEngine>,
        Arc::clone(&tts) as Arc<dyn SynthesisEngine>,
    );
    let events = pipeline.subscribe();
    Harness {
        pipeline,
        replies,
        events,
        llm,
        tts,
    }
}

/// Wait for the first event matching `matches`, discarding the rest.
pub(crate) async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<PipelineEvent>,
    matches: F,
) -> PipelineEvent
where
    F: Fn(&PipelineEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed in time")
}

/// Server-sent events body for an OpenAI-style streamed completion.
pub(crate) fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let chunk = serde_json::json!({"choices": [{"delta": {"content": fragment}}]});
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Little-endian PCM16 bytes.
pub(crate) fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
