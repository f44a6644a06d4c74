//! Workflow execution: sequential, batched-parallel and dependency-DAG.
//!
//! Validation failures (duplicate ids, unknown dependencies, cycles) reject
//! [`TaskOrchestrator::execute`] before any task runs. Once execution starts,
//! every task in the workflow ends up in the result map: tasks that never ran
//! are recorded as `cancelled` with the reason they were skipped.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use super::board::TaskBoard;
use super::runner::TaskRunner;
use super::types::{Strategy, TaskDefinition, TaskResult, TaskStatus, Workflow, WorkflowOptions};
use crate::error::OrchestrationError;

pub const SKIPPED_AFTER_FAILURE: &str = "Skipped due to previous failure";
pub const DEPENDENCY_FAILED: &str = "Dependency failed";
pub const WORKFLOW_STOPPED: &str = "Workflow stopped due to failure";

pub type WorkflowResults = BTreeMap<String, TaskResult>;

#[derive(Debug, Clone)]
pub enum OrchestrationEvent {
    TaskStarted { task_id: String },
    TaskCompleted(TaskResult),
    AllComplete(WorkflowResults),
}

pub struct TaskOrchestrator {
    runner: TaskRunner,
    events: Option<UnboundedSender<OrchestrationEvent>>,
}

impl TaskOrchestrator {
    pub fn new(runner: TaskRunner) -> Self {
        Self { runner, events: None }
    }

    pub fn with_events(mut self, events: UnboundedSender<OrchestrationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn create_workflow(name: impl Into<String>, tasks: Vec<TaskDefinition>, strategy: Strategy) -> Workflow {
        Workflow::new(name, tasks, strategy)
    }

    /// `true` if every edge names a task in `tasks` and the graph is acyclic.
    pub fn validate_dag(tasks: &[TaskDefinition], dependencies: &HashMap<String, Vec<String>>) -> bool {
        check_dag(tasks, dependencies).is_ok()
    }

    pub async fn execute(
        &self,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResults, OrchestrationError> {
        let mut seen = HashSet::new();
        for task in &workflow.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(OrchestrationError::DuplicateTaskId(task.id.clone()));
            }
        }

        let options = &workflow.options;
        let dependencies = workflow.dependency_map();
        if options.strategy == Strategy::Dag {
            check_dag(&workflow.tasks, &dependencies)?;
        }

        tracing::info!(
            workflow = %workflow.id,
            name = %workflow.name,
            strategy = ?options.strategy,
            tasks = workflow.tasks.len(),
            "Workflow started"
        );

        let run_cancel = cancel.child_token();
        let work = async {
            match options.strategy {
                Strategy::Sequential => self.run_sequential(&workflow.tasks, options, &run_cancel).await,
                Strategy::Parallel => self.run_parallel(&workflow.tasks, options, &run_cancel).await,
                Strategy::Dag => {
                    self.run_dag(&workflow.tasks, &dependencies, options, &run_cancel)
                        .await
                }
            }
        };

        let results = match options.timeout() {
            Some(timeout) => {
                tokio::select! {
                    results = work => results,
                    _ = tokio::time::sleep(timeout) => {
                        run_cancel.cancel();
                        tracing::warn!(workflow = %workflow.id, timeout_ms = timeout.as_millis() as u64, "Workflow timed out");
                        return Err(OrchestrationError::Timeout(timeout));
                    }
                }
            }
            None => work.await,
        };

        tracing::info!(workflow = %workflow.id, results = results.len(), "Workflow finished");
        self.emit(OrchestrationEvent::AllComplete(results.clone()));
        Ok(results)
    }

    async fn run_sequential(
        &self,
        tasks: &[TaskDefinition],
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> WorkflowResults {
        let mut results = WorkflowResults::new();
        for task in tasks {
            let result = self.run_one(task, cancel).await;
            let failed = result.status == TaskStatus::Failed;
            results.insert(task.id.clone(), result);
            if failed && !options.continue_on_error {
                skip_remaining(tasks, &mut results, SKIPPED_AFTER_FAILURE);
                break;
            }
        }
        results
    }

    async fn run_parallel(
        &self,
        tasks: &[TaskDefinition],
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> WorkflowResults {
        let mut results = WorkflowResults::new();
        let batch_size = options.max_parallel.unwrap_or(tasks.len()).max(1);

        for batch in tasks.chunks(batch_size) {
            let batch_results = join_all(batch.iter().map(|task| self.run_one(task, cancel))).await;
            let failed = batch_results.iter().any(|r| r.status == TaskStatus::Failed);
            for result in batch_results {
                results.insert(result.task_id.clone(), result);
            }
            if failed && !options.continue_on_error {
                skip_remaining(tasks, &mut results, SKIPPED_AFTER_FAILURE);
                break;
            }
        }
        results
    }

    async fn run_dag(
        &self,
        tasks: &[TaskDefinition],
        dependencies: &HashMap<String, Vec<String>>,
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> WorkflowResults {
        let mut results = WorkflowResults::new();
        let mut board = TaskBoard::new();
        let definitions: HashMap<&str, &TaskDefinition> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        // Ids and edges were validated before execution started.
        for task in tasks {
            let _ = board.create(&task.id, task.display_name(), task.description.clone());
        }
        for (task, deps) in dependencies {
            for dep in deps {
                let _ = board.add_blocked_by(task, dep);
            }
        }

        let max_parallel = options.max_parallel.unwrap_or(tasks.len()).max(1);
        let mut running = FuturesUnordered::new();
        let mut stopped = false;

        loop {
            // Propagate failures through chains of dependents.
            loop {
                let doomed: Vec<String> = board
                    .with_status(TaskStatus::Pending)
                    .into_iter()
                    .filter(|t| board.dependency_failed(&t.id))
                    .map(|t| t.id.clone())
                    .collect();
                if doomed.is_empty() {
                    break;
                }
                for id in doomed {
                    board.set_status(&id, TaskStatus::Cancelled);
                    let result = TaskResult::skipped(&id, DEPENDENCY_FAILED);
                    self.emit(OrchestrationEvent::TaskCompleted(result.clone()));
                    results.insert(id, result);
                }
            }

            if !stopped {
                let ready: Vec<String> = board.ready().into_iter().map(|t| t.id.clone()).collect();
                for id in ready.into_iter().take(max_parallel.saturating_sub(running.len())) {
                    let Some(task) = definitions.get(id.as_str()).copied() else {
                        continue;
                    };
                    board.set_status(&id, TaskStatus::Running);
                    running.push(self.run_one(task, cancel));
                }
            }

            let Some(result) = running.next().await else {
                break;
            };
            board.set_status(&result.task_id, result.status);
            if result.status == TaskStatus::Failed && !options.continue_on_error {
                stopped = true;
            }
            results.insert(result.task_id.clone(), result);
        }

        for task in board.with_status(TaskStatus::Pending) {
            let result = TaskResult::skipped(&task.id, WORKFLOW_STOPPED);
            self.emit(OrchestrationEvent::TaskCompleted(result.clone()));
            results.insert(task.id.clone(), result);
        }
        results
    }

    async fn run_one(&self, task: &TaskDefinition, cancel: &CancellationToken) -> TaskResult {
        self.emit(OrchestrationEvent::TaskStarted {
            task_id: task.id.clone(),
        });
        let result = self.runner.run(task, cancel).await;
        self.emit(OrchestrationEvent::TaskCompleted(result.clone()));
        result
    }

    fn emit(&self, event: OrchestrationEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn skip_remaining(tasks: &[TaskDefinition], results: &mut WorkflowResults, reason: &str) {
    for task in tasks {
        if !results.contains_key(&task.id) {
            results.insert(task.id.clone(), TaskResult::skipped(&task.id, reason));
        }
    }
}

/// Edge check, then three-colour DFS over the dependency graph.
fn check_dag(
    tasks: &[TaskDefinition],
    dependencies: &HashMap<String, Vec<String>>,
) -> Result<(), OrchestrationError> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for (task, deps) in dependencies {
        if !ids.contains(task.as_str()) {
            return Err(OrchestrationError::UnknownDependency {
                task: task.clone(),
                dependency: deps.first().cloned().unwrap_or_default(),
            });
        }
        if let Some(missing) = deps.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(OrchestrationError::UnknownDependency {
                task: task.clone(),
                dependency: missing.clone(),
            });
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit<'a>(
        id: &'a str,
        dependencies: &'a HashMap<String, Vec<String>>,
        colors: &mut HashMap<&'a str, Color>,
    ) -> bool {
        colors.insert(id, Color::Gray);
        for dep in dependencies.get(id).into_iter().flatten() {
            match colors.get(dep.as_str()).copied().unwrap_or(Color::White) {
                Color::Gray => return true,
                Color::White if visit(dep, dependencies, colors) => return true,
                _ => {}
            }
        }
        colors.insert(id, Color::Black);
        false
    }

    let mut colors: HashMap<&str, Color> = HashMap::new();
    for task in tasks {
        if colors.get(task.id.as_str()).copied().unwrap_or(Color::White) == Color::White
            && visit(&task.id, dependencies, &mut colors)
        {
            return Err(OrchestrationError::CycleDetected);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs(ids: &[&str]) -> Vec<TaskDefinition> {
        ids.iter().map(|id| TaskDefinition::new(*id, "x")).collect()
    }

    fn deps(edges: &[(&str, &str)]) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (task, dep) in edges {
            map.entry(task.to_string()).or_default().push(dep.to_string());
        }
        map
    }

    #[test]
    fn acyclic_graph_is_valid() {
        let tasks = defs(&["a", "b", "c", "d"]);
        let map = deps(&[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")]);
        assert!(TaskOrchestrator::validate_dag(&tasks, &map));
    }

    #[test]
    fn cycles_are_detected() {
        let tasks = defs(&["a", "b", "c"]);
        assert!(!TaskOrchestrator::validate_dag(&tasks, &deps(&[("a", "b"), ("b", "c"), ("c", "a")])));
        assert!(!TaskOrchestrator::validate_dag(&tasks, &deps(&[("a", "a")])));
        assert_eq!(
            check_dag(&tasks, &deps(&[("a", "b"), ("b", "a")])),
            Err(OrchestrationError::CycleDetected)
        );
    }

    #[test]
    fn unknown_dependency_is_invalid() {
        let tasks = defs(&["a"]);
        assert_eq!(
            check_dag(&tasks, &deps(&[("a", "ghost")])),
            Err(OrchestrationError::UnknownDependency {
                task: "a".into(),
                dependency: "ghost".into()
            })
        );
        assert!(!TaskOrchestrator::validate_dag(&tasks, &deps(&[("ghost", "a")])));
    }
}
