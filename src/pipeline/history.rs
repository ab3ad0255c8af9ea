//! In-memory conversation history for completion prompts.

use crate::llm::{ChatMessage, CompletionRequest};

/// Completed user/assistant turns, bounded to the most recent messages.
///
/// Only replies that finished without an abort are recorded. History lives
/// for the process lifetime and is never persisted.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    system_prompt: String,
    messages: Vec<ChatMessage>,
    max_messages: usize,
}

impl ConversationHistory {
    /// `max_messages` of 0 disables trimming.
    pub fn new(system_prompt: impl Into<String>, max_messages: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            max_messages,
        }
    }

    /// Record a finished exchange.
    pub fn push_turn(&mut self, user: &str, assistant: &str) {
        let assistant = assistant.trim();
        if user.trim().is_empty() || assistant.is_empty() {
            return;
        }
        self.messages.push(ChatMessage::user(user.trim()));
        self.messages.push(ChatMessage::assistant(assistant));
        self.trim();
    }

    /// Prompt for a new user utterance: system prompt, history, then `user_text`.
    pub fn request_for(&self, user_text: &str) -> CompletionRequest {
        let mut messages = Vec::with_capacity(self.messages.len() + 2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(self.messages.iter().cloned());
        messages.push(ChatMessage::user(user_text));
        CompletionRequest { messages }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn trim(&mut self) {
        if self.max_messages == 0 || self.messages.len() <= self.max_messages {
            return;
        }
        let mut drain_end = self.messages.len() - self.max_messages;
        // Never start the window on an assistant message.
        if drain_end % 2 == 1 {
            drain_end += 1;
        }
        self.messages.drain(..drain_end.min(self.messages.len()));
    }
}
