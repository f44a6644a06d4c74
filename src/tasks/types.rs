//! Shared vocabulary of the task engine.
//!
//! [`TaskDefinition`] is what callers submit (and what workflow files
//! contain); [`TaskResult`] is what comes back, one per attempt chain.
//! [`Task`] is the board entity the orchestrator tracks dependency state on.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::SubAgentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of work as submitted by a caller or read from a workflow file.
///
/// Unset budgets fall back to the runner's configured defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub prompt: String,
    /// Restrict the sub-agent to these tools. `None` means every tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub kind: SubAgentKind,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: None,
            prompt: prompt.into(),
            tools: None,
            timeout_ms: None,
            max_retries: None,
            retry_delay_ms: None,
            dependencies: Vec::new(),
            kind: SubAgentKind::General,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_dependencies<S: Into<String>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_delay_ms = Some(retry_delay.as_millis() as u64);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_ms.map(Duration::from_millis)
    }

    /// Name for display; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// Outcome of one task's attempt chain. Never mutated after it is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    /// Retries consumed (attempts minus one).
    pub retries: u32,
}

impl TaskResult {
    /// Result for a task that never ran.
    pub fn skipped(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Cancelled,
            output: None,
            error: Some(reason.into()),
            start_time: now,
            end_time: now,
            duration_ms: 0,
            retries: 0,
        }
    }
}

/// Serialize a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    /// 0 to 100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn new(task_id: impl Into<String>, status: TaskStatus, progress: u8, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            progress: progress.min(100),
            message: Some(message.into()),
        }
    }
}

/// Board entity. Dependency edges are kept symmetric by [`super::TaskBoard`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub subject: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    /// Tasks this one waits on.
    pub depends_on: Vec<String>,
    /// Tasks waiting on this one.
    pub dependents: Vec<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Sequential,
    Parallel,
    Dag,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowOptions {
    pub strategy: Strategy,
    pub continue_on_error: bool,
    /// Concurrency cap for `parallel` and `dag`. Unset means all tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkflowOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A set of tasks plus a strategy.
///
/// Workflow files (JSON or TOML) deserialize straight into this type:
///
/// ```toml
/// name = "release"
///
/// [options]
/// strategy = "dag"
///
/// [[tasks]]
/// id = "build"
/// prompt = "Build the project"
///
/// [[tasks]]
/// id = "test"
/// prompt = "Run the tests"
/// dependencies = ["build"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "workflow_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub options: WorkflowOptions,
    /// Explicit edges, merged with each task's own `dependencies`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub dependencies: HashMap<String, Vec<String>>,
}

fn workflow_id() -> String {
    format!("workflow-{}", Utc::now().timestamp_millis())
}

impl Workflow {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskDefinition>, strategy: Strategy) -> Self {
        Self {
            id: workflow_id(),
            name: name.into(),
            tasks,
            options: WorkflowOptions {
                strategy,
                ..WorkflowOptions::default()
            },
            dependencies: HashMap::new(),
        }
    }

    /// Union of the explicit map and every task's `dependencies`, without
    /// duplicate edges. Keyed by dependent task id.
    pub fn dependency_map(&self) -> HashMap<String, Vec<String>> {
        let mut merged: HashMap<String, Vec<String>> = HashMap::new();
        let explicit = self
            .dependencies
            .iter()
            .flat_map(|(task, deps)| deps.iter().map(move |d| (task, d)));
        let declared = self
            .tasks
            .iter()
            .flat_map(|t| t.dependencies.iter().map(move |d| (&t.id, d)));
        for (task, dep) in explicit.chain(declared) {
            let entry = merged.entry(task.clone()).or_default();
            if !entry.contains(dep) {
                entry.push(dep.clone());
            }
        }
        merged
    }
}
