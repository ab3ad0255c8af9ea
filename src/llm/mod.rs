//! Language model completion.
//!
//! The pipeline talks to the model through [`CompletionEngine`], which turns a
//! [`CompletionRequest`] into a [`TokenStream`]. The bundled backend is
//! [`ApiCompletionEngine`], which speaks the OpenAI chat completions protocol:
//! - Ollama (`http://localhost:11434`)
//! - MLX server (`http://localhost:8080`)
//! - vLLM, llama.cpp server, etc.

pub mod api;
pub mod sse;

pub use api::ApiCompletionEngine;

use crate::error::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Incremental text fragments produced by a completion engine.
///
/// Dropping the stream closes the underlying connection.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Everything a completion engine needs for one reply.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Full prompt: system message, history, then the new user turn.
    pub messages: Vec<ChatMessage>,
}

impl CompletionRequest {
    /// Text of the last user message, if any.
    pub fn user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// A source of streamed completions.
#[async_trait]
pub trait CompletionEngine: Send + Sync {
    /// Start a completion and return its token stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started (connection refused,
    /// non-success HTTP status, ...). Errors that occur mid-stream are yielded
    /// as stream items instead.
    async fn stream_completion(&self, request: CompletionRequest) -> Result<TokenStream>;

    /// Release server-side resources for in-flight completions.
    ///
    /// Called best-effort by the abort path after the token stream has been
    /// dropped. The default does nothing.
    async fn cancel(&self) -> Result<()> {
        Ok(())
    }
}

/// Incrementally strips `<think>...</think>` blocks across streaming chunks.
#[derive(Debug, Default)]
pub(crate) struct ThinkTagStripper {
    in_think_block: bool,
    carry: String,
}

impl ThinkTagStripper {
    const OPEN: &'static str = "<think>";
    const CLOSE: &'static str = "</think>";

    /// Feed one fragment and return newly-visible text (outside think blocks).
    pub(crate) fn push(&mut self, fragment: &str) -> String {
        if fragment.is_empty() {
            return String::new();
        }
        self.carry.push_str(fragment);

        let mut visible = String::new();
        loop {
            if self.in_think_block {
                if let Some(end) = self.carry.find(Self::CLOSE) {
                    self.carry.drain(..end + Self::CLOSE.len());
                    self.in_think_block = false;
                    continue;
                }
                // Keep only the minimal suffix needed to detect `</think>` across chunks.
                let keep = floor_boundary(&self.carry, Self::CLOSE.len().saturating_sub(1));
                self.carry.drain(..keep);
                break;
            }

            if let Some(start) = self.carry.find(Self::OPEN) {
                visible.push_str(&self.carry[..start]);
                self.carry.drain(..start + Self::OPEN.len());
                self.in_think_block = true;
                continue;
            }

            // Hold back a suffix that could be the start of a tag.
            let emit = floor_boundary(&self.carry, Self::OPEN.len().saturating_sub(1));
            visible.push_str(&self.carry[..emit]);
            self.carry.drain(..emit);
            break;
        }

        visible
    }

    /// Flush any remaining visible tail.
    pub(crate) fn finish(&mut self) -> String {
        if self.in_think_block {
            self.carry.clear();
            return String::new();
        }
        std::mem::take(&mut self.carry)
    }
}

/// Byte offset that leaves at most `keep` trailing bytes, moved back to the
/// nearest char boundary.
fn floor_boundary(text: &str, keep: usize) -> usize {
    let mut idx = text.len().saturating_sub(keep);
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
