//! Runs one task definition with bounded retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::types::{TaskDefinition, TaskProgress, TaskResult, TaskStatus};
use crate::agent::{AgentEvent, SubAgent, SubAgentConfig, SubAgentResult};
use crate::provider::ChatProvider;
use crate::tools::ToolExecutor;

/// Executes a single attempt of a task. Progress is reported by sending the
/// agent's own events on `events`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &TaskDefinition,
        cancel: CancellationToken,
        events: UnboundedSender<AgentEvent>,
    ) -> SubAgentResult;
}

/// Production executor: one [`SubAgent`] per attempt.
pub struct SubAgentExecutor {
    provider: Arc<dyn ChatProvider>,
    tools: ToolExecutor,
    defaults: SubAgentConfig,
}

impl SubAgentExecutor {
    pub fn new(provider: Arc<dyn ChatProvider>, tools: ToolExecutor, defaults: SubAgentConfig) -> Self {
        Self {
            provider,
            tools,
            defaults,
        }
    }
}

#[async_trait]
impl TaskExecutor for SubAgentExecutor {
    async fn execute(
        &self,
        task: &TaskDefinition,
        cancel: CancellationToken,
        events: UnboundedSender<AgentEvent>,
    ) -> SubAgentResult {
        let mut config = self.defaults.clone();
        config.kind = task.kind;
        if let Some(timeout) = task.timeout() {
            config.timeout = timeout;
        }
        if !task.name.is_empty() {
            config.context.push(("Task".to_string(), task.name.clone()));
        }
        if let Some(description) = &task.description {
            config.context.push(("Description".to_string(), description.clone()));
        }

        let mut sub_agent = SubAgent::new(self.provider.clone(), &self.tools, config);
        if let Some(tools) = &task.tools {
            sub_agent = sub_agent.with_tools(tools);
        }
        sub_agent.execute(&task.prompt, &cancel, Some(events)).await
    }
}

pub type ProgressCallback = Arc<dyn Fn(&TaskProgress) + Send + Sync>;

/// Retry budget applied when a task does not set its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDefaults {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Runs tasks through a [`TaskExecutor`], retrying failed attempts with a
/// linear backoff (`retry_delay * attempt`).
///
/// Cheap to clone; clones share the active-task and progress tables.
#[derive(Clone)]
pub struct TaskRunner {
    executor: Arc<dyn TaskExecutor>,
    defaults: RetryDefaults,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
    progress: Arc<Mutex<HashMap<String, TaskProgress>>>,
    on_progress: Option<ProgressCallback>,
}

impl TaskRunner {
    pub fn new(executor: Arc<dyn TaskExecutor>, defaults: RetryDefaults) -> Self {
        Self {
            executor,
            defaults,
            active: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(Mutex::new(HashMap::new())),
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Run `task` to a terminal result. Never returns `Err`: failures and
    /// cancellation are recorded in the result's status.
    pub async fn run(&self, task: &TaskDefinition, cancel: &CancellationToken) -> TaskResult {
        let start_time = Utc::now();
        let clock = Instant::now();
        let max_retries = task.max_retries.unwrap_or(self.defaults.max_retries);
        let retry_delay = task.retry_delay().unwrap_or(self.defaults.retry_delay);

        let token = cancel.child_token();
        self.active.lock().insert(task.id.clone(), token.clone());
        self.update(TaskProgress::new(&task.id, TaskStatus::Running, 0, "Starting task"));
        tracing::debug!(task = %task.id, max_retries, "Task started");

        let mut retries = 0u32;
        let (status, outcome) = loop {
            let attempt = self.attempt(task, &token).await;
            let status = if attempt.cancelled || token.is_cancelled() {
                TaskStatus::Cancelled
            } else if attempt.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            if status != TaskStatus::Failed || retries >= max_retries {
                break (status, attempt);
            }

            retries += 1;
            let delay = retry_delay * retries;
            tracing::warn!(
                task = %task.id,
                retry = retries,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %attempt.output,
                "Task attempt failed, retrying"
            );
            self.update(TaskProgress::new(
                &task.id,
                TaskStatus::Running,
                0,
                format!("Retrying ({retries}/{max_retries})"),
            ));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {
                    break (TaskStatus::Cancelled, SubAgentResult {
                        cancelled: true,
                        ..attempt
                    });
                }
            }
        };

        self.active.lock().remove(&task.id);
        let end_time = Utc::now();
        let (progress, message) = match status {
            TaskStatus::Completed => (100, "Task completed"),
            TaskStatus::Cancelled => (0, "Task cancelled"),
            _ => (100, "Task failed"),
        };
        self.update(TaskProgress::new(&task.id, status, progress, message));
        tracing::info!(task = %task.id, %status, retries, "Task finished");

        let (output, error) = match status {
            TaskStatus::Completed => (Some(outcome.output), None),
            _ => (None, Some(outcome.output)),
        };
        TaskResult {
            task_id: task.id.clone(),
            status,
            output,
            error,
            start_time,
            end_time,
            duration_ms: clock.elapsed().as_millis() as u64,
            retries,
        }
    }

    /// Signal a running task. Returns `false` if it is not running.
    pub fn cancel(&self, task_id: &str) -> bool {
        let Some(token) = self.active.lock().get(task_id).cloned() else {
            return false;
        };
        token.cancel();
        self.update(TaskProgress::new(
            task_id,
            TaskStatus::Cancelled,
            0,
            "Task cancelled by user",
        ));
        true
    }

    /// Most recent progress report for a task, running or finished.
    pub fn progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.progress.lock().get(task_id).cloned()
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.active.lock().contains_key(task_id)
    }

    async fn attempt(&self, task: &TaskDefinition, token: &CancellationToken) -> SubAgentResult {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let execution = self.executor.execute(task, token.clone(), tx);
        tokio::pin!(execution);

        loop {
            tokio::select! {
                result = &mut execution => {
                    while let Ok(event) = rx.try_recv() {
                        self.on_event(&task.id, event);
                    }
                    return result;
                }
                Some(event) = rx.recv() => self.on_event(&task.id, event),
            }
        }
    }

    fn on_event(&self, task_id: &str, event: AgentEvent) {
        let progress = match event {
            AgentEvent::ToolCall(call) => TaskProgress::new(
                task_id,
                TaskStatus::Running,
                50,
                format!("Executing tool: {}", call.name),
            ),
            AgentEvent::Text(_) => TaskProgress::new(task_id, TaskStatus::Running, 75, "Processing response"),
            AgentEvent::ToolResult { .. } => {
                TaskProgress::new(task_id, TaskStatus::Running, 80, "Tool execution completed")
            }
            AgentEvent::Done(_) => TaskProgress::new(task_id, TaskStatus::Running, 100, "Finishing"),
            AgentEvent::Error(message) => TaskProgress::new(task_id, TaskStatus::Failed, 0, message),
            _ => return,
        };
        self.update(progress);
    }

    fn update(&self, progress: TaskProgress) {
        if let Some(callback) = &self.on_progress {
            callback(&progress);
        }
        self.progress.lock().insert(progress.task_id.clone(), progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{StopReason, TurnOutcome};
    use crate::provider::ToolCall;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskExecutor for Flaky {
        async fn execute(
            &self,
            task: &TaskDefinition,
            _: CancellationToken,
            events: UnboundedSender<AgentEvent>,
        ) -> SubAgentResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = events.send(AgentEvent::ToolCall(ToolCall::new("c", "file_read", "{}")));
            let _ = events.send(AgentEvent::Done(TurnOutcome {
                content: String::new(),
                iterations: 1,
                stop: StopReason::Completed,
            }));
            SubAgentResult {
                success: n >= self.failures,
                output: format!("{} attempt {n}", task.id),
                iterations: 1,
                cancelled: false,
                elapsed: Duration::ZERO,
            }
        }
    }

    /// Waits until cancelled.
    struct Blocking;

    #[async_trait]
    impl TaskExecutor for Blocking {
        async fn execute(
            &self,
            _: &TaskDefinition,
            cancel: CancellationToken,
            _: UnboundedSender<AgentEvent>,
        ) -> SubAgentResult {
            cancel.cancelled().await;
            SubAgentResult {
                success: false,
                output: "Cancelled".into(),
                iterations: 0,
                cancelled: true,
                elapsed: Duration::ZERO,
            }
        }
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let executor = flaky(2);
        let runner = TaskRunner::new(executor.clone(), RetryDefaults::default());
        let task = TaskDefinition::new("t", "go").with_retries(3, Duration::from_millis(100));

        let result = runner.run(&task, &CancellationToken::new()).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.retries, 2);
        assert_eq!(result.output.as_deref(), Some("t attempt 2"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_failure_when_budget_exhausted() {
        let executor = flaky(10);
        let runner = TaskRunner::new(executor.clone(), RetryDefaults::default());
        let task = TaskDefinition::new("t", "go").with_retries(1, Duration::from_millis(10));

        let result = runner.run(&task, &CancellationToken::new()).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("t attempt 1"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(runner.progress("t").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_linear() {
        let runner = TaskRunner::new(flaky(2), RetryDefaults::default());
        let task = TaskDefinition::new("t", "go").with_retries(2, Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        runner.run(&task, &CancellationToken::new()).await;
        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancel_stops_running_task_without_retry() {
        let runner = TaskRunner::new(Arc::new(Blocking), RetryDefaults::default());
        let task = TaskDefinition::new("t", "go").with_retries(5, Duration::from_millis(1));

        let handle = {
            let runner = runner.clone();
            let task = task.clone();
            tokio::spawn(async move { runner.run(&task, &CancellationToken::new()).await })
        };
        while !runner.is_running("t") {
            tokio::task::yield_now().await;
        }
        assert!(runner.cancel("t"));

        let result = handle.await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.retries, 0);
        assert!(!runner.is_running("t"));
        assert!(!runner.cancel("t"));
    }

    #[tokio::test]
    async fn progress_callback_sees_event_mapping() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let runner = TaskRunner::new(flaky(0), RetryDefaults::default())
            .with_progress(Arc::new(move |p: &TaskProgress| sink.lock().push(p.progress)));

        runner
            .run(&TaskDefinition::new("t", "go"), &CancellationToken::new())
            .await;
        assert_eq!(*seen.lock(), vec![0, 50, 100, 100]);
    }
}
