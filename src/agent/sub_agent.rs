//! Bounded, isolated agent used as the unit of work for a task.
//!
//! A [`SubAgent`] gets its own context, a goal-directed system prompt, an
//! iteration cap and a wall-clock budget. Confirm-level tools are granted
//! automatically for the lifetime of the sub-agent; deny policies still hold.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::agent_loop::{Agent, AgentSettings};
use super::events::{AgentEvent, StopReason};
use super::system_prompt::{SubAgentKind, build_sub_agent_prompt};
use crate::provider::ChatProvider;
use crate::tools::{AlwaysGrant, ToolExecutor};

pub const TIMEOUT_OUTPUT: &str = "Error: Sub-agent timeout";

#[derive(Debug, Clone, PartialEq)]
pub struct SubAgentConfig {
    pub kind: SubAgentKind,
    pub max_iterations: u32,
    pub timeout: Duration,
    /// Extra key/value lines for the prompt's context section.
    pub context: Vec<(String, String)>,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            kind: SubAgentKind::General,
            max_iterations: 20,
            timeout: Duration::from_secs(300),
            context: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAgentResult {
    pub success: bool,
    pub output: String,
    pub iterations: u32,
    pub cancelled: bool,
    #[serde(with = "crate::tasks::types::duration_ms")]
    pub elapsed: Duration,
}

pub struct SubAgent {
    provider: Arc<dyn ChatProvider>,
    executor: ToolExecutor,
    config: SubAgentConfig,
}

impl SubAgent {
    /// Build from the parent's executor. The tool set is inherited; the
    /// permission gate keeps its policies but approves confirm-level calls.
    pub fn new(provider: Arc<dyn ChatProvider>, parent: &ToolExecutor, config: SubAgentConfig) -> Self {
        let permissions = Arc::new(parent.permissions().derive(Arc::new(AlwaysGrant)));
        Self {
            provider,
            executor: parent.scoped(parent.registry().clone(), permissions),
            config,
        }
    }

    /// Restrict the tool set to the named tools. Unknown names are ignored.
    pub fn with_tools<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        let registry = self.executor.registry().subset(names);
        self.executor = self
            .executor
            .scoped(registry, self.executor.permissions().clone());
        self
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn config(&self) -> &SubAgentConfig {
        &self.config
    }

    /// Run one turn toward `goal`, racing it against the configured timeout.
    pub async fn execute(
        &self,
        goal: &str,
        cancel: &CancellationToken,
        events: Option<UnboundedSender<AgentEvent>>,
    ) -> SubAgentResult {
        let started = Instant::now();
        let prompt = build_sub_agent_prompt(
            self.config.kind,
            goal,
            &self.config.context,
            &self.executor.definitions(),
        );
        let settings = AgentSettings {
            max_iterations: self.config.max_iterations,
            ..AgentSettings::default()
        };
        let mut agent = Agent::new(self.provider.clone(), self.executor.clone(), settings)
            .with_system_prompt(prompt);
        if let Some(tx) = events {
            agent = agent.with_events(tx);
        }

        let turn_cancel = cancel.child_token();
        let finished = tokio::select! {
            outcome = agent.send_message(goal, &turn_cancel) => Some(outcome),
            _ = tokio::time::sleep(self.config.timeout) => None,
        };
        let elapsed = started.elapsed();

        let Some(outcome) = finished else {
            turn_cancel.cancel();
            tracing::warn!(
                timeout_secs = self.config.timeout.as_secs_f64(),
                "Sub-agent timed out"
            );
            return SubAgentResult {
                success: false,
                output: TIMEOUT_OUTPUT.to_string(),
                iterations: 0,
                cancelled: false,
                elapsed,
            };
        };

        match outcome {
            Ok(turn) if turn.stop == StopReason::Cancelled => SubAgentResult {
                success: false,
                output: if turn.content.is_empty() {
                    "Cancelled".to_string()
                } else {
                    turn.content
                },
                iterations: turn.iterations,
                cancelled: true,
                elapsed,
            },
            Ok(turn) => {
                tracing::debug!(
                    iterations = turn.iterations,
                    stop = ?turn.stop,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Sub-agent finished"
                );
                SubAgentResult {
                    success: true,
                    output: turn.content,
                    iterations: turn.iterations,
                    cancelled: false,
                    elapsed,
                }
            }
            Err(e) => SubAgentResult {
                success: false,
                output: format!("Error: {e}"),
                iterations: 0,
                cancelled: false,
                elapsed,
            },
        }
    }
}
