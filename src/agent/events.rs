//! Status and event types published by the agent loop.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::context::CompactResult;
use crate::provider::ToolCall;
use crate::tools::ToolResult;

/// Agent state. Written by the loop and by an open permission prompt,
/// observed through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    ToolUse,
    WaitingInput,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Thinking => "thinking",
            AgentStatus::ToolUse => "tool_use",
            AgentStatus::WaitingInput => "waiting_input",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Shared writer for an agent's status.
///
/// The loop owns one; an approval prompt holds a clone so it can report
/// `waiting_input` while it blocks on the user.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    tx: Arc<watch::Sender<AgentStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AgentStatus::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> AgentStatus {
        *self.tx.borrow()
    }

    /// Set the status, returning the previous one.
    pub fn set(&self, status: AgentStatus) -> AgentStatus {
        self.tx.send_replace(status)
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model answered without requesting tools.
    Completed,
    /// The iteration cap was reached while the model was still calling tools.
    MaxIterations,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// Result of one `send_message` turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    /// Last non-empty assistant text produced during the turn.
    pub content: String,
    pub iterations: u32,
    pub stop: StopReason,
}

/// Progress events, delivered in order over an unbounded channel.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    StatusChanged(AgentStatus),
    /// Incremental text as it streams in.
    TextDelta(String),
    /// Full text of one assistant response.
    Text(String),
    ToolCall(ToolCall),
    ToolResult {
        call_id: String,
        name: String,
        result: ToolResult,
    },
    Compacted(CompactResult),
    Done(TurnOutcome),
    Error(String),
}
