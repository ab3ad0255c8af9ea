//! OpenAI-compatible chat completions backend.
//!
//! Streams responses via Server-Sent Events so the first tokens reach the
//! sentence-boundary detector as soon as the server produces them.

use crate::config::LlmConfig;
use crate::error::{Result, SpeechError};
use crate::llm::sse::SseLineParser;
use crate::llm::{CompletionEngine, CompletionRequest, ThinkTagStripper, TokenStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tracing::{debug, info};

/// Completion engine using an OpenAI-compatible HTTP API.
pub struct ApiCompletionEngine {
    config: LlmConfig,
    url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for ApiCompletionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCompletionEngine")
            .field("url", &self.url)
            .field("model", &self.config.api_model)
            .finish()
    }
}

impl ApiCompletionEngine {
    /// Create a new engine for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .build()
            .map_err(|e| SpeechError::Llm(format!("failed to build HTTP client: {e}")))?;
        let url = chat_completions_url(&config.api_url);

        info!("API LLM configured: {url} model={}", config.api_model);

        Ok(Self {
            config: config.clone(),
            url,
            client,
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.api_model,
            "messages": request.messages,
            "stream": true,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionEngine for ApiCompletionEngine {
    async fn stream_completion(&self, request: CompletionRequest) -> Result<TokenStream> {
        let body = self.build_body(&request);

        let mut builder = self.client.post(&self.url).json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SpeechError::Llm(format!("API request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(SpeechError::Llm(format!(
                "API HTTP {}: {}",
                status.as_u16(),
                extract_error_message(&body_text)
            )));
        }

        debug!(messages = request.messages.len(), "completion stream opened");
        Ok(Box::pin(token_stream(response.bytes_stream())))
    }
}

/// Normalise a base URL to the chat completions endpoint.
fn chat_completions_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{base}/v1/chat/completions")
}

/// Extract `error.message` from a JSON error body, falling back to the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

/// Pull `choices[0].delta.content` out of one streamed chunk.
fn parse_delta(data: &str) -> Result<Option<String>> {
    let chunk: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| SpeechError::Llm(format!("JSON parse error: {e}")))?;
    Ok(chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_owned))
}

/// Turn a raw SSE byte stream into visible text fragments.
fn token_stream(
    bytes: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut parser = SseLineParser::new();
        let mut stripper = ThinkTagStripper::default();

        'read: loop {
            let events = match bytes.next().await {
                Some(Ok(chunk)) => parser.push(&chunk),
                Some(Err(e)) => {
                    yield Err(SpeechError::Llm(format!("stream read error: {e}")));
                    return;
                }
                None => {
                    let tail: Vec<_> = parser.flush().into_iter().collect();
                    if tail.is_empty() {
                        break 'read;
                    }
                    tail
                }
            };

            for event in events {
                if event.is_done() {
                    break 'read;
                }
                match parse_delta(&event.data) {
                    Ok(Some(text)) => {
                        let visible = stripper.push(&text);
                        if !visible.is_empty() {
                            yield Ok(visible);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        let tail = stripper.finish();
        if !tail.is_empty() {
            yield Ok(tail);
        }
    }
}
