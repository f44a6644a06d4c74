//! The agent conversation loop.
//!
//! One [`Agent`] owns one conversation. A call to [`Agent::send_message`]
//! runs a full turn:
//!
//! 1. Append the user message and move to `thinking`
//! 2. Compact the context if it crossed the token threshold
//! 3. Stream a response, relaying text deltas as events
//! 4. Append the assistant message; stop if it requested no tools
//! 5. Otherwise run each tool call in order, append the results, repeat
//!
//! The loop is bounded by `max_iterations`. Cancellation is checked at every
//! suspension point and ends the turn cleanly; provider errors move the agent
//! to `error` and are returned.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::events::{AgentEvent, AgentStatus, StatusHandle, StopReason, TurnOutcome};
use super::session::{Session, SessionStore};
use crate::context::{CompactResult, Compactor, ContextManager};
use crate::error::{AgentError, ProviderError};
use crate::provider::{ChatProvider, Message, StreamChunk, ToolCall};
use crate::tools::ToolExecutor;

/// Tool message appended for calls skipped because the turn was cancelled.
const SKIPPED_TOOL_CALL: &str = "Error: Cancelled before execution";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSettings {
    pub max_iterations: u32,
    /// Estimated-token level at which the context is compacted before a turn.
    pub compaction_threshold: usize,
    pub compactor: Compactor,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            compaction_threshold: 100_000,
            compactor: Compactor::default(),
        }
    }
}

pub struct Agent {
    provider: Arc<dyn ChatProvider>,
    executor: ToolExecutor,
    context: ContextManager,
    settings: AgentSettings,
    status: StatusHandle,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    store: Option<Arc<dyn SessionStore>>,
    session: Option<Session>,
}

impl Agent {
    pub fn new(provider: Arc<dyn ChatProvider>, executor: ToolExecutor, settings: AgentSettings) -> Self {
        Self {
            provider,
            executor,
            context: ContextManager::new(),
            settings,
            status: StatusHandle::new(),
            events: None,
            store: None,
            session: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.context.set_system_prompt(prompt);
        self
    }

    /// Publish status through `status` instead of a private handle.
    pub fn with_status(mut self, status: StatusHandle) -> Self {
        self.status = status;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach a session. Its messages (and system prompt, if it has one)
    /// replace the current context; the agent saves it after every turn.
    pub fn with_session(mut self, store: Arc<dyn SessionStore>, session: Session) -> Self {
        if let Some(prompt) = &session.system_prompt {
            self.context.set_system_prompt(prompt.clone());
        }
        self.context.replace_messages(session.messages.clone());
        self.store = Some(store);
        self.session = Some(session);
        self
    }

    pub fn status(&self) -> AgentStatus {
        self.status.get()
    }

    pub fn status_handle(&self) -> &StatusHandle {
        &self.status
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ContextManager {
        &mut self.context
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    /// Clear the conversation (system prompt kept) and return to idle.
    pub fn reset(&mut self) {
        self.context.clear();
        self.set_status(AgentStatus::Idle);
    }

    /// Mark the agent as blocked on user input (e.g. an approval prompt).
    pub fn set_waiting_input(&self) {
        self.set_status(AgentStatus::WaitingInput);
    }

    /// Compact now, regardless of the threshold.
    pub async fn compact(&mut self, cancel: &CancellationToken) -> Option<CompactResult> {
        let result = self
            .context
            .compact(&self.settings.compactor, self.provider.as_ref(), cancel)
            .await?;
        self.emit(AgentEvent::Compacted(result.clone()));
        self.persist().await;
        Some(result)
    }

    pub async fn send_message(
        &mut self,
        text: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        self.context.add_user_message(text);
        self.set_status(AgentStatus::Thinking);

        if self.context.needs_compaction(self.settings.compaction_threshold) {
            if let Some(result) = self
                .context
                .compact(&self.settings.compactor, self.provider.as_ref(), cancel)
                .await
            {
                self.emit(AgentEvent::Compacted(result));
            }
        }

        let tools = self.executor.definitions();
        let mut content = String::new();
        let mut iterations = 0u32;
        let mut stop = StopReason::MaxIterations;

        while iterations < self.settings.max_iterations {
            if cancel.is_cancelled() {
                stop = StopReason::Cancelled;
                break;
            }
            iterations += 1;

            let response = match self.stream_response(&tools, cancel).await {
                Ok(response) => response,
                Err(ProviderError::Cancelled) => {
                    stop = StopReason::Cancelled;
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, kind = e.kind(), iteration = iterations, "Turn failed");
                    self.set_status(AgentStatus::Error);
                    self.emit(AgentEvent::Error(e.to_string()));
                    self.persist().await;
                    return Err(e.into());
                }
            };

            if !response.content.is_empty() {
                content = response.content.clone();
                self.emit(AgentEvent::Text(response.content.clone()));
            }
            let calls = response.tool_calls.clone();
            self.context.push(response);

            if calls.is_empty() {
                stop = StopReason::Completed;
                break;
            }

            self.set_status(AgentStatus::ToolUse);
            if !self.run_tool_calls(&calls, cancel).await {
                stop = StopReason::Cancelled;
                break;
            }
            self.set_status(AgentStatus::Thinking);
        }

        if stop == StopReason::MaxIterations {
            tracing::warn!(
                max_iterations = self.settings.max_iterations,
                "Reached max iterations, ending turn"
            );
        }

        let outcome = TurnOutcome {
            content,
            iterations,
            stop,
        };
        self.set_status(AgentStatus::Idle);
        self.emit(AgentEvent::Done(outcome.clone()));
        self.persist().await;
        Ok(outcome)
    }

    async fn stream_response(
        &self,
        tools: &[crate::tools::ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<Message, ProviderError> {
        let messages = self.context.messages();
        let events = self.events.clone();
        let mut on_chunk = move |chunk: &StreamChunk| {
            if let (Some(tx), StreamChunk::Text(text)) = (&events, chunk) {
                let _ = tx.send(AgentEvent::TextDelta(text.clone()));
            }
        };
        self.provider
            .chat_stream(&messages, tools, cancel, &mut on_chunk)
            .await
    }

    /// Execute calls in the order received. Returns `false` if the turn was
    /// cancelled; the remaining calls then get a placeholder result so every
    /// call in the log stays answered.
    async fn run_tool_calls(&mut self, calls: &[ToolCall], cancel: &CancellationToken) -> bool {
        for (i, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                for skipped in &calls[i..] {
                    self.context.add_tool_message(&skipped.id, SKIPPED_TOOL_CALL);
                }
                return false;
            }

            tracing::info!(tool = %call.name, id = %call.id, "Tool call");
            self.emit(AgentEvent::ToolCall(call.clone()));

            let result = self.executor.execute(call, cancel).await;
            if !result.success {
                tracing::debug!(tool = %call.name, error = ?result.error, "Tool call failed");
            }
            self.context
                .add_tool_message(&call.id, result.to_message_content());
            self.emit(AgentEvent::ToolResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                result,
            });
        }
        true
    }

    fn set_status(&self, status: AgentStatus) {
        let previous = self.status.set(status);
        if previous != status {
            self.emit(AgentEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn persist(&mut self) {
        let (Some(store), Some(session)) = (&self.store, &mut self.session) else {
            return;
        };
        session.messages = self.context.history().to_vec();
        session.system_prompt = self.context.system_prompt().map(str::to_string);
        session.updated_at = chrono::Utc::now();
        if let Err(e) = store.save(session).await {
            tracing::warn!(session = %session.id, error = %e, "Failed to save session");
        }
    }
}
