//! Conversation context: the ordered message log owned by one agent, token
//! estimation over it, and summarizing compaction.

pub mod compactor;
pub mod tokens;

pub use compactor::{CompactResult, Compactor};

use tokio_util::sync::CancellationToken;

use crate::provider::{ChatProvider, Message, ToolCall};

/// Message log plus an optional system prompt.
///
/// The system prompt is held separately and prepended by [`messages`]; the
/// log itself is append-only except for compaction and restore, which replace
/// it wholesale.
///
/// [`messages`]: ContextManager::messages
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    system_prompt: Option<String>,
    log: Vec<Message>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: Some(prompt.into()),
            log: Vec::new(),
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.is_empty()).then_some(prompt);
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.log.push(Message::user(content));
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.log
            .push(Message::assistant_with_tools(content, tool_calls));
    }

    pub fn add_tool_message(&mut self, tool_call_id: impl Into<String>, content: impl Into<String>) {
        self.log.push(Message::tool(tool_call_id, content));
    }

    pub fn push(&mut self, message: Message) {
        self.log.push(message);
    }

    /// System prompt (if set) followed by the log; this is what gets sent.
    pub fn messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.log.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            out.push(Message::system(prompt.clone()));
        }
        out.extend(self.log.iter().cloned());
        out
    }

    /// The log without the system prompt.
    pub fn history(&self) -> &[Message] {
        &self.log
    }

    pub fn message_count(&self) -> usize {
        self.log.len()
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.log = messages;
    }

    pub fn estimate_tokens(&self) -> usize {
        let prompt = self
            .system_prompt
            .as_deref()
            .map_or(0, |p| tokens::estimate_text(p) + tokens::MESSAGE_OVERHEAD);
        prompt + tokens::estimate_messages(&self.log)
    }

    pub fn estimate_message_tokens(&self, message: &Message) -> usize {
        tokens::estimate_message(message)
    }

    pub fn needs_compaction(&self, threshold: usize) -> bool {
        self.estimate_tokens() >= threshold
    }

    /// Summarize the older part of the log. The system prompt is untouched.
    pub async fn compact(
        &mut self,
        compactor: &Compactor,
        provider: &dyn ChatProvider,
        cancel: &CancellationToken,
    ) -> Option<CompactResult> {
        let (messages, result) = compactor.compact(&self.log, provider, cancel).await?;
        self.log = messages;
        Some(result)
    }
}
