//! Time-based dispatch of individual tasks onto a [`TaskRunner`].
//!
//! Each scheduled entry gets its own tokio task that sleeps until the entry's
//! `next_run`, then runs it. Entries leave the queue when they finish or are
//! cancelled; their results stay available through [`TaskScheduler::completed`]
//! and [`TaskScheduler::wait`] until [`TaskScheduler::cleanup`] evicts them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::runner::TaskRunner;
use super::types::{TaskDefinition, TaskProgress, TaskResult};
use crate::error::SchedulerError;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Schedule {
    Immediate,
    After(#[serde(with = "super::types::duration_ms")] Duration),
    At(DateTime<Utc>),
    /// Accepted by the type but rejected by [`TaskScheduler::schedule`].
    Cron(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledStatus {
    Scheduled,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub id: String,
    pub task: TaskDefinition,
    pub schedule: Schedule,
    pub next_run: DateTime<Utc>,
    pub status: ScheduledStatus,
}

struct Entry {
    scheduled: ScheduledTask,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    queue: Vec<Entry>,
    completed: HashMap<String, TaskResult>,
    counter: u64,
    stopped: bool,
}

struct Inner {
    runner: TaskRunner,
    max_queue_size: usize,
    state: Mutex<State>,
    finished: Notify,
    root: CancellationToken,
}

/// Cloneable handle; all clones share one queue.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(runner: TaskRunner, max_queue_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                max_queue_size,
                state: Mutex::new(State::default()),
                finished: Notify::new(),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Queue `task` under `schedule` and return the scheduled entry id.
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, task: TaskDefinition, schedule: Schedule) -> Result<String, SchedulerError> {
        let now = Utc::now();
        let delay = match &schedule {
            Schedule::Immediate => Duration::ZERO,
            Schedule::After(delay) => *delay,
            Schedule::At(at) => (*at - now).to_std().unwrap_or(Duration::ZERO),
            Schedule::Cron(expr) => {
                return Err(SchedulerError::UnsupportedSchedule(format!("cron `{expr}`")));
            }
        };
        let next_run = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let cancel = self.inner.root.child_token();
        let id = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(SchedulerError::Stopped);
            }
            if state.queue.len() >= self.inner.max_queue_size {
                return Err(SchedulerError::QueueFull {
                    max: self.inner.max_queue_size,
                });
            }
            state.counter += 1;
            let id = format!("sched-{}-{}", now.timestamp_millis(), state.counter);
            state.queue.push(Entry {
                scheduled: ScheduledTask {
                    id: id.clone(),
                    task,
                    schedule,
                    next_run,
                    status: ScheduledStatus::Scheduled,
                },
                cancel: cancel.clone(),
            });
            id
        };
        tracing::debug!(id = %id, delay_ms = delay.as_millis() as u64, "Task scheduled");

        let inner = self.inner.clone();
        let entry_id = id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
            let Some(task) = inner.mark_running(&entry_id) else {
                return;
            };
            let result = inner.runner.run(&task, &cancel).await;
            inner.finish(&entry_id, result);
        });

        Ok(id)
    }

    /// Run `task` right away, outside the queue, and wait for its result.
    pub async fn execute_now(&self, task: &TaskDefinition) -> TaskResult {
        self.inner.runner.run(task, &self.inner.root).await
    }

    pub fn execute_after(&self, task: TaskDefinition, delay: Duration) -> Result<String, SchedulerError> {
        self.schedule(task, Schedule::After(delay))
    }

    pub fn execute_at(&self, task: TaskDefinition, at: DateTime<Utc>) -> Result<String, SchedulerError> {
        self.schedule(task, Schedule::At(at))
    }

    /// Cancel by scheduled id or task id. A pending entry is dropped from the
    /// queue; a running one is signalled and finishes as `cancelled`.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(index) = state
            .queue
            .iter()
            .position(|e| e.scheduled.id == id || e.scheduled.task.id == id)
        else {
            drop(state);
            return self.inner.runner.cancel(id);
        };

        let entry = &state.queue[index];
        entry.cancel.cancel();
        if entry.scheduled.status == ScheduledStatus::Running {
            return true;
        }

        let entry = state.queue.remove(index);
        let result = TaskResult::skipped(&entry.scheduled.task.id, "Cancelled before start");
        state.completed.insert(entry.scheduled.id, result);
        drop(state);
        self.inner.finished.notify_waiters();
        true
    }

    /// Snapshot of entries that have not finished yet.
    pub fn queue(&self) -> Vec<ScheduledTask> {
        self.inner
            .state
            .lock()
            .queue
            .iter()
            .map(|e| e.scheduled.clone())
            .collect()
    }

    /// Finished results keyed by scheduled id.
    pub fn completed(&self) -> HashMap<String, TaskResult> {
        self.inner.state.lock().completed.clone()
    }

    /// Evict finished results. Returns how many were removed; `wait` on an
    /// evicted id returns `None`.
    pub fn cleanup(&self) -> usize {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.completed.len();
            state.completed.clear();
            removed
        };
        tracing::debug!(removed, "Cleaned up scheduled task results");
        removed
    }

    pub fn progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.inner.runner.progress(task_id)
    }

    /// Wait for a scheduled entry to finish. `None` if the id is unknown.
    pub async fn wait(&self, id: &str) -> Option<TaskResult> {
        loop {
            let notified = self.inner.finished.notified();
            {
                let state = self.inner.state.lock();
                if let Some(result) = state.completed.get(id) {
                    return Some(result.clone());
                }
                if !state.queue.iter().any(|e| e.scheduled.id == id) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting work and drop every entry that has not started.
    /// Running entries finish normally.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        let (waiting, running): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut state.queue)
            .into_iter()
            .partition(|e| e.scheduled.status == ScheduledStatus::Scheduled);
        state.queue = running;
        for entry in waiting {
            entry.cancel.cancel();
            let result = TaskResult::skipped(&entry.scheduled.task.id, "Scheduler stopped");
            state.completed.insert(entry.scheduled.id, result);
        }
        drop(state);
        self.inner.finished.notify_waiters();
    }
}

impl Inner {
    fn mark_running(&self, id: &str) -> Option<TaskDefinition> {
        let mut state = self.state.lock();
        let entry = state.queue.iter_mut().find(|e| e.scheduled.id == id)?;
        entry.scheduled.status = ScheduledStatus::Running;
        Some(entry.scheduled.task.clone())
    }

    fn finish(&self, id: &str, result: TaskResult) {
        let mut state = self.state.lock();
        state.queue.retain(|e| e.scheduled.id != id);
        state.completed.insert(id.to_string(), result);
        drop(state);
        self.finished.notify_waiters();
    }
}
