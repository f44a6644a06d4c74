//! Bounded-concurrency queue of independently started tasks.
//!
//! [`BackgroundManager::start`] queues a task and admits queued tasks in FIFO
//! order while fewer than `max_concurrent` are running. Results are kept
//! until [`BackgroundManager::cleanup`] evicts them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::runner::TaskRunner;
use super::types::{TaskDefinition, TaskProgress, TaskResult, TaskStatus};
use crate::error::BackgroundError;

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Text buffer that keeps only the most recent `limit` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBuffer {
    data: String,
    limit: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: String::new(),
            limit,
        }
    }

    pub fn push(&mut self, text: &str) {
        if !self.data.is_empty() && !self.data.ends_with('\n') {
            self.data.push('\n');
        }
        self.data.push_str(text);
        if self.data.len() > self.limit {
            let mut cut = self.data.len() - self.limit;
            while !self.data.is_char_boundary(cut) {
                cut += 1;
            }
            self.data.drain(..cut);
        }
    }

    pub fn contents(&self) -> &str {
        &self.data
    }
}

/// Snapshot of one background task.
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundTask {
    pub id: String,
    pub definition: TaskDefinition,
    pub progress: TaskProgress,
    pub result: Option<TaskResult>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackgroundStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct Entry {
    task: BackgroundTask,
    output: OutputBuffer,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Entry>,
    order: Vec<String>,
    queue: VecDeque<String>,
    running: usize,
}

/// Cloneable handle; clones share the same queue and task table.
#[derive(Clone)]
pub struct BackgroundManager {
    runner: TaskRunner,
    max_concurrent: usize,
    output_limit: usize,
    inner: Arc<Mutex<Inner>>,
    finished: Arc<Notify>,
    root: CancellationToken,
}

impl BackgroundManager {
    pub fn new(runner: TaskRunner, max_concurrent: usize) -> Self {
        Self {
            runner,
            max_concurrent: max_concurrent.max(1),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            inner: Arc::new(Mutex::new(Inner::default())),
            finished: Arc::new(Notify::new()),
            root: CancellationToken::new(),
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Queue a task and try to admit it. An empty id gets a fresh UUID.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, mut definition: TaskDefinition) -> Result<String, BackgroundError> {
        if definition.id.is_empty() {
            definition.id = Uuid::new_v4().to_string();
        }
        if definition.name.is_empty() {
            let short: String = definition.id.chars().take(8).collect();
            definition.name = format!("Background Task {short}");
        }
        let id = definition.id.clone();

        {
            let mut inner = self.inner.lock();
            if inner.tasks.contains_key(&id) {
                return Err(BackgroundError::DuplicateId(id));
            }
            inner.tasks.insert(
                id.clone(),
                Entry {
                    task: BackgroundTask {
                        id: id.clone(),
                        definition,
                        progress: TaskProgress::new(&id, TaskStatus::Pending, 0, "Queued"),
                        result: None,
                        started_at: Utc::now(),
                    },
                    output: OutputBuffer::new(self.output_limit),
                    cancel: self.root.child_token(),
                },
            );
            inner.order.push(id.clone());
            inner.queue.push_back(id.clone());
        }
        tracing::debug!(task = %id, "Background task queued");

        self.admit();
        Ok(id)
    }

    fn admit(&self) {
        loop {
            let (definition, cancel) = {
                let mut inner = self.inner.lock();
                if inner.running >= self.max_concurrent {
                    return;
                }
                let Some(id) = inner.queue.pop_front() else {
                    return;
                };
                let Some(entry) = inner.tasks.get_mut(&id) else {
                    continue;
                };
                entry.task.progress = TaskProgress::new(&id, TaskStatus::Running, 0, "Starting...");
                let admitted = (entry.task.definition.clone(), entry.cancel.clone());
                inner.running += 1;
                admitted
            };

            let this = self.clone();
            tokio::spawn(async move {
                let result = this.runner.run(&definition, &cancel).await;
                this.finish(result);
            });
        }
    }

    fn finish(&self, result: TaskResult) {
        {
            let mut inner = self.inner.lock();
            inner.running = inner.running.saturating_sub(1);
            if let Some(entry) = inner.tasks.get_mut(&result.task_id) {
                if let Some(text) = result.output.as_deref().or(result.error.as_deref()) {
                    entry.output.push(text);
                }
                entry.task.progress = TaskProgress::new(
                    &result.task_id,
                    result.status,
                    100,
                    format!("Task {}", result.status),
                );
                entry.task.result = Some(result);
            }
        }
        self.finished.notify_waiters();
        self.admit();
    }

    /// Snapshot of a task. A running task reports the runner's live progress.
    pub fn status(&self, id: &str) -> Option<BackgroundTask> {
        let mut task = self.inner.lock().tasks.get(id).map(|e| e.task.clone())?;
        if task.progress.status == TaskStatus::Running {
            if let Some(live) = self.runner.progress(id) {
                task.progress = live;
            }
        }
        Some(task)
    }

    /// All tasks in start order.
    pub fn list(&self) -> Vec<BackgroundTask> {
        let ids = self.inner.lock().order.clone();
        ids.iter().filter_map(|id| self.status(id)).collect()
    }

    pub fn output(&self, id: &str) -> Option<String> {
        self.inner
            .lock()
            .tasks
            .get(id)
            .map(|e| e.output.contents().to_string())
    }

    /// Wait for a task's result.
    pub async fn wait(&self, id: &str) -> Result<TaskResult, BackgroundError> {
        loop {
            let notified = self.finished.notified();
            {
                let inner = self.inner.lock();
                let entry = inner
                    .tasks
                    .get(id)
                    .ok_or_else(|| BackgroundError::NotFound(id.to_string()))?;
                if let Some(result) = &entry.task.result {
                    return Ok(result.clone());
                }
            }
            notified.await;
        }
    }

    /// Wait until no task lacks a result; returns every result in start order.
    pub async fn wait_all(&self) -> Vec<TaskResult> {
        loop {
            let notified = self.finished.notified();
            {
                let inner = self.inner.lock();
                let results: Option<Vec<TaskResult>> = inner
                    .order
                    .iter()
                    .filter_map(|id| inner.tasks.get(id))
                    .map(|e| e.task.result.clone())
                    .collect();
                if let Some(results) = results {
                    return results;
                }
            }
            notified.await;
        }
    }

    /// Drop a queued task or signal a running one. Returns `false` for
    /// unknown or already finished tasks.
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some((status, token)) = inner
            .tasks
            .get(id)
            .map(|e| (e.task.progress.status, e.cancel.clone()))
        else {
            return false;
        };
        match status {
            TaskStatus::Pending => {
                inner.queue.retain(|q| q != id);
                if let Some(entry) = inner.tasks.get_mut(id) {
                    entry.task.progress = TaskProgress::new(id, TaskStatus::Cancelled, 0, "Cancelled by user");
                    entry.task.result = Some(TaskResult::skipped(id, "Cancelled by user"));
                }
                drop(inner);
                self.finished.notify_waiters();
                true
            }
            TaskStatus::Running => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Evict finished tasks. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut inner = self.inner.lock();
        let done: Vec<String> = inner
            .tasks
            .iter()
            .filter(|(_, e)| e.task.result.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &done {
            inner.tasks.remove(id);
        }
        inner.order.retain(|id| !done.contains(id));
        tracing::debug!(removed = done.len(), "Cleaned up background tasks");
        done.len()
    }

    pub fn stats(&self) -> BackgroundStats {
        let inner = self.inner.lock();
        let mut stats = BackgroundStats {
            total: inner.tasks.len(),
            ..BackgroundStats::default()
        };
        for entry in inner.tasks.values() {
            match entry.task.progress.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Signal every running task and drop everything still queued.
    pub fn shutdown(&self) {
        let queued: Vec<String> = self.inner.lock().queue.iter().cloned().collect();
        for id in queued {
            self.cancel(&id);
        }
        self.root.cancel();
    }
}
