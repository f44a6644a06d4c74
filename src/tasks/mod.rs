//! Task engine: runner, time-based scheduler, workflow orchestrator and the
//! background queue. Every task attempt runs through a [`TaskExecutor`],
//! which in production is a sub-agent.

pub mod background;
pub mod board;
pub mod orchestrator;
pub mod runner;
pub mod scheduler;
pub mod types;

pub use background::{BackgroundManager, BackgroundStats, BackgroundTask, OutputBuffer};
pub use board::TaskBoard;
pub use orchestrator::{OrchestrationEvent, TaskOrchestrator, WorkflowResults};
pub use runner::{ProgressCallback, RetryDefaults, SubAgentExecutor, TaskExecutor, TaskRunner};
pub use scheduler::{Schedule, ScheduledStatus, ScheduledTask, TaskScheduler};
pub use types::{
    Strategy, Task, TaskDefinition, TaskProgress, TaskResult, TaskStatus, Workflow, WorkflowOptions,
};
