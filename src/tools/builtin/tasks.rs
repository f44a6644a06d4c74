//! Tools that hand work to the task engine: `background` queues and inspects
//! background tasks, `spawn_agent` runs a sub-agent and waits for its report.
//!
//! Both sit on top of a base executor that does not contain them, so a
//! sub-agent can never spawn further sub-agents.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use crate::agent::{SubAgent, SubAgentConfig, SubAgentKind, sub_agent::TIMEOUT_OUTPUT};
use crate::provider::ChatProvider;
use crate::tasks::{BackgroundManager, TaskDefinition};
use crate::tools::{Tool, ToolContext, ToolDefinition, ToolExecutor, ToolResult, validate_arguments};

const BACKGROUND_ACTIONS: [&str; 6] = ["start", "status", "list", "cancel", "output", "stats"];

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| json!({"error": format!("Failed to serialize result: {e}")}).to_string())
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value.and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

pub struct BackgroundTool {
    manager: BackgroundManager,
}

impl BackgroundTool {
    pub fn new(manager: BackgroundManager) -> Self {
        Self { manager }
    }

    fn start(&self, args: &Value) -> ToolResult {
        let prompt = args["prompt"].as_str().unwrap_or_default();
        let id = args.get("id").and_then(Value::as_str).unwrap_or_default();
        let mut task = TaskDefinition::new(id, prompt);
        if let Some(name) = args.get("name").and_then(Value::as_str) {
            task.name = name.to_string();
        }
        task.tools = string_list(args.get("tools"));

        match self.manager.start(task) {
            Ok(id) => ToolResult::success(json!({"id": id, "status": "pending"}).to_string()),
            Err(e) => ToolResult::error(e.to_string()),
        }
    }

    fn list(&self) -> ToolResult {
        let tasks: Vec<Value> = self
            .manager
            .list()
            .into_iter()
            .map(|task| {
                json!({
                    "id": task.id,
                    "name": task.definition.display_name(),
                    "status": task.progress.status,
                    "progress": task.progress.progress,
                    "message": task.progress.message,
                })
            })
            .collect();
        ToolResult::success(to_json(&tasks)).with_metadata("count", json!(tasks.len()))
    }
}

#[async_trait]
impl Tool for BackgroundTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "background",
            "Run prompts as background tasks and inspect them. Actions: \
             start (requires prompt; optional name, id, tools) returns the task id; \
             status, cancel and output require id; list and stats take no arguments. \
             Background tasks run as sub-agents without access to this tool.",
            json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": BACKGROUND_ACTIONS,
                        "description": "What to do"
                    },
                    "prompt": {
                        "type": "string",
                        "description": "Goal for the task (start)"
                    },
                    "name": {
                        "type": "string",
                        "description": "Display name (start)"
                    },
                    "id": {
                        "type": "string",
                        "description": "Task id (status, cancel, output; optional for start)"
                    },
                    "tools": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Restrict the task to these tools (start)"
                    }
                },
                "required": ["action"]
            }),
        )
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        validate_arguments(&self.definition().parameters, args)?;
        let action = args["action"].as_str().unwrap_or_default();
        let needs = match action {
            "start" => Some("prompt"),
            "status" | "cancel" | "output" => Some("id"),
            "list" | "stats" => None,
            other => {
                return Err(format!(
                    "unknown action '{other}', expected one of: {}",
                    BACKGROUND_ACTIONS.join(", ")
                ));
            }
        };
        match needs {
            Some(field) if args.get(field).and_then(Value::as_str).is_none_or(str::is_empty) => {
                Err(format!("action '{action}' requires '{field}'"))
            }
            _ => Ok(()),
        }
    }

    /// The action, so `background:start` can be gated separately from reads.
    fn resource(&self, args: &Value) -> Option<String> {
        args.get("action").and_then(Value::as_str).map(str::to_string)
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> ToolResult {
        let id = args.get("id").and_then(Value::as_str).unwrap_or_default();
        match args["action"].as_str().unwrap_or_default() {
            "start" => self.start(&args),
            "status" => match self.manager.status(id) {
                Some(task) => ToolResult::success(to_json(&task)),
                None => ToolResult::error(format!("Background task not found: {id}")),
            },
            "list" => self.list(),
            "cancel" => {
                if self.manager.cancel(id) {
                    ToolResult::success(json!({"id": id, "cancelled": true}).to_string())
                } else {
                    ToolResult::error(format!("No pending or running background task: {id}"))
                }
            }
            "output" => match self.manager.output(id) {
                Some(output) => ToolResult::success(output),
                None => ToolResult::error(format!("Background task not found: {id}")),
            },
            "stats" => ToolResult::success(to_json(&self.manager.stats())),
            other => ToolResult::error(format!("Unknown action: {other}")),
        }
    }
}

pub struct SpawnAgentTool {
    provider: Arc<dyn ChatProvider>,
    parent: ToolExecutor,
    defaults: SubAgentConfig,
}

impl SpawnAgentTool {
    /// `parent` supplies the sub-agent's tools, workspace and policies.
    pub fn new(provider: Arc<dyn ChatProvider>, parent: ToolExecutor, defaults: SubAgentConfig) -> Self {
        Self {
            provider,
            parent,
            defaults,
        }
    }
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "spawn_agent",
            "Delegate a self-contained goal to a sub-agent with a fresh context and wait \
             for its report. Use kind \"explore\" for read-only investigation. The \
             sub-agent cannot spawn further agents.",
            json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "The goal, with every detail the sub-agent needs"
                    },
                    "kind": {
                        "type": "string",
                        "enum": ["general", "explore"],
                        "description": "Sub-agent flavour (default general)"
                    },
                    "tools": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Restrict the sub-agent to these tools"
                    },
                    "timeout_secs": {
                        "type": "integer",
                        "description": "Wall-clock budget in seconds"
                    }
                },
                "required": ["prompt"]
            }),
        )
    }

    fn validate(&self, args: &Value) -> Result<(), String> {
        validate_arguments(&self.definition().parameters, args)?;
        match args.get("kind").and_then(Value::as_str) {
            None | Some("general") | Some("explore") => Ok(()),
            Some(other) => Err(format!("unknown kind '{other}', expected general or explore")),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let prompt = args["prompt"].as_str().unwrap_or_default();
        let mut config = self.defaults.clone();
        if args.get("kind").and_then(Value::as_str) == Some("explore") {
            config.kind = SubAgentKind::Explore;
        }
        if let Some(secs) = args.get("timeout_secs").and_then(Value::as_u64) {
            config.timeout = Duration::from_secs(secs.max(1));
        }

        let mut sub_agent = SubAgent::new(self.provider.clone(), &self.parent, config);
        if let Some(tools) = string_list(args.get("tools")) {
            sub_agent = sub_agent.with_tools(&tools);
        }
        tracing::info!(kind = ?sub_agent.config().kind, "Spawning sub-agent");

        let result = sub_agent.execute(prompt, &ctx.cancel, None).await;
        let elapsed_ms = result.elapsed.as_millis() as u64;
        let tool_result = if result.success {
            ToolResult::success(result.output)
        } else {
            let reason = if result.cancelled {
                "Sub-agent cancelled"
            } else if result.output == TIMEOUT_OUTPUT {
                "Sub-agent timed out"
            } else {
                "Sub-agent did not complete"
            };
            ToolResult::failure(result.output, reason)
        };
        tool_result
            .with_metadata("iterations", json!(result.iterations))
            .with_metadata("elapsed_ms", json!(elapsed_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentEvent, SubAgentResult};
    use crate::tasks::{RetryDefaults, TaskExecutor, TaskRunner};
    use tokio::sync::mpsc::UnboundedSender;
    use tokio_util::sync::CancellationToken;

    struct Idle;

    #[async_trait]
    impl TaskExecutor for Idle {
        async fn execute(
            &self,
            _: &TaskDefinition,
            _: CancellationToken,
            _: UnboundedSender<AgentEvent>,
        ) -> SubAgentResult {
            SubAgentResult {
                success: true,
                output: String::new(),
                iterations: 0,
                cancelled: false,
                elapsed: Duration::ZERO,
            }
        }
    }

    fn background() -> BackgroundTool {
        let runner = TaskRunner::new(Arc::new(Idle), RetryDefaults::default());
        BackgroundTool::new(BackgroundManager::new(runner, 1))
    }

    #[test]
    fn background_validates_per_action() {
        let tool = background();
        assert!(tool.validate(&json!({"action": "list"})).is_ok());
        assert!(tool.validate(&json!({"action": "stats"})).is_ok());

        let err = tool.validate(&json!({"action": "start"})).unwrap_err();
        assert!(err.contains("prompt"), "got: {err}");
        let err = tool.validate(&json!({"action": "output", "id": ""})).unwrap_err();
        assert!(err.contains("id"), "got: {err}");
        let err = tool.validate(&json!({"action": "explode"})).unwrap_err();
        assert!(err.contains("unknown action"), "got: {err}");
    }

    #[test]
    fn background_resource_is_the_action() {
        assert_eq!(
            background().resource(&json!({"action": "start", "prompt": "x"})),
            Some("start".to_string())
        );
    }
}
