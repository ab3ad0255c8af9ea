//! Fake engines shared by the pipeline unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::error::{Result, SpeechError};
use crate::llm::{CompletionEngine, CompletionRequest, TokenStream};
use crate::pipeline::messages::AudioChunk;
use crate::tts::{AudioStream, SynthesisEngine};
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How a scripted completion behaves.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Yield these tokens, then end.
    Tokens(Vec<&'static str>),
    /// Yield these tokens, then never end.
    Hang(Vec<&'static str>),
    /// Refuse to start.
    FailStart(&'static str),
    /// Yield these tokens, then fail.
    FailAfter(Vec<&'static str>, &'static str),
    /// Never finish starting.
    Stall,
}

/// Completion engine that plays back one [`Script`] per request.
pub(crate) struct ScriptedCompletion {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    requests: Mutex<Vec<CompletionRequest>>,
    cancels: AtomicUsize,
}

impl ScriptedCompletion {
    pub(crate) fn new(scripts: Vec<Script>, fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
        }
    }

    pub(crate) fn always(script: Script) -> Self {
        Self::new(Vec::new(), script)
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

fn tokens(list: Vec<&'static str>) -> impl futures_util::Stream<Item = Result<String>> + Send {
    stream::iter(list.into_iter().map(|t| Ok(t.to_owned())))
}

#[async_trait]
impl CompletionEngine for ScriptedCompletion {
    async fn stream_completion(&self, request: CompletionRequest) -> Result<TokenStream> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(match script {
            Script::Tokens(list) => tokens(list).boxed(),
            Script::Hang(list) => tokens(list).chain(stream::pending::<Result<String>>()).boxed(),
            Script::FailStart(message) => return Err(SpeechError::Llm(message.to_owned())),
            Script::Stall => return futures_util::future::pending().await,
            Script::FailAfter(list, message) => tokens(list)
                .chain(stream::once(async move {
                    Err(SpeechError::Llm(message.to_owned()))
                }))
                .boxed(),
        })
    }

    async fn cancel(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Synthesis engine whose chunks carry the byte length of the text they
/// were made from, so tests can tell segments apart by sample value.
pub(crate) struct ToneSynthesis {
    chunks_per_call: usize,
    fail_on: Option<&'static str>,
    texts: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl ToneSynthesis {
    pub(crate) fn new(chunks_per_call: usize) -> Self {
        Self {
            chunks_per_call,
            fail_on: None,
            texts: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }
    }

    /// Fail any call whose text contains `needle`.
    pub(crate) fn failing_on(mut self, needle: &'static str) -> Self {
        self.fail_on = Some(needle);
        self
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

pub(crate) const TONE_RATE: u32 = 24_000;

#[async_trait]
impl SynthesisEngine for ToneSynthesis {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.texts.lock().unwrap().push(text.to_owned());
        if self.fail_on.is_some_and(|needle| text.contains(needle)) {
            return Err(SpeechError::Tts(format!("cannot say {text:?}")));
        }
        let value = i16::try_from(text.len()).unwrap_or(i16::MAX);
        let chunks: Vec<Result<AudioChunk>> = (0..self.chunks_per_call)
            .map(|_| Ok(AudioChunk::new(vec![value; 240], TONE_RATE)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        TONE_RATE
    }
}
