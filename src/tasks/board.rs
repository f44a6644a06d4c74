//! In-memory task board with symmetric dependency edges.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Map;

use super::types::{Task, TaskStatus};
use crate::error::OrchestrationError;

/// Owns a set of [`Task`] entities.
///
/// `depends_on` and `dependents` are only ever changed together, so for any
/// edge A -> B, A lists B in `depends_on` exactly when B lists A in
/// `dependents`.
#[derive(Debug, Default)]
pub struct TaskBoard {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        id: impl Into<String>,
        subject: impl Into<String>,
        description: Option<String>,
    ) -> Result<&Task, OrchestrationError> {
        let id = id.into();
        if self.tasks.contains_key(&id) {
            return Err(OrchestrationError::DuplicateTaskId(id));
        }
        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            subject: subject.into(),
            description,
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            dependents: Vec::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        };
        self.order.push(id.clone());
        Ok(self.tasks.entry(id).or_insert(task))
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks in creation order.
    pub fn list(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns `false` if the task does not exist.
    pub fn set_status(&mut self, id: &str, status: TaskStatus) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) => {
                task.status = status;
                task.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Record that `task` waits on `blocker`. Adding an existing edge is a
    /// no-op.
    pub fn add_blocked_by(&mut self, task: &str, blocker: &str) -> Result<(), OrchestrationError> {
        if !self.tasks.contains_key(task) || !self.tasks.contains_key(blocker) {
            return Err(OrchestrationError::UnknownDependency {
                task: task.to_string(),
                dependency: blocker.to_string(),
            });
        }

        let now = Utc::now();
        if let Some(t) = self.tasks.get_mut(task) {
            if !t.depends_on.iter().any(|d| d == blocker) {
                t.depends_on.push(blocker.to_string());
                t.updated_at = now;
            }
        }
        if let Some(b) = self.tasks.get_mut(blocker) {
            if !b.dependents.iter().any(|d| d == task) {
                b.dependents.push(task.to_string());
                b.updated_at = now;
            }
        }
        Ok(())
    }

    pub fn remove_blocked_by(&mut self, task: &str, blocker: &str) {
        if let Some(t) = self.tasks.get_mut(task) {
            t.depends_on.retain(|d| d != blocker);
        }
        if let Some(b) = self.tasks.get_mut(blocker) {
            b.dependents.retain(|d| d != task);
        }
    }

    /// Remove a task and every edge touching it.
    pub fn remove(&mut self, id: &str) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        self.order.retain(|o| o != id);
        for dep in &task.depends_on {
            if let Some(b) = self.tasks.get_mut(dep) {
                b.dependents.retain(|d| d != id);
            }
        }
        for dependent in &task.dependents {
            if let Some(t) = self.tasks.get_mut(dependent) {
                t.depends_on.retain(|d| d != id);
            }
        }
        Some(task)
    }

    /// Pending tasks whose dependencies have all completed, in creation order.
    pub fn ready(&self) -> Vec<&Task> {
        self.list()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on
                    .iter()
                    .all(|d| self.status_of(d) == Some(TaskStatus::Completed))
            })
            .collect()
    }

    /// Whether any dependency of `id` ended without completing.
    pub fn dependency_failed(&self, id: &str) -> bool {
        self.tasks.get(id).is_some_and(|t| {
            t.depends_on.iter().any(|d| {
                matches!(
                    self.status_of(d),
                    Some(TaskStatus::Failed | TaskStatus::Cancelled)
                )
            })
        })
    }

    pub fn with_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.list().into_iter().filter(|t| t.status == status).collect()
    }

    fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }
}
