pub mod files;
pub mod guard;
pub mod shell;
pub mod tasks;

pub use files::{FileReadTool, FileWriteTool, ListDirTool};
pub use guard::{CommandFilter, WorkspaceGuard, default_blocklist};
pub use shell::{ExecResult, ShellExecTool, execute_shell};
pub use tasks::{BackgroundTool, SpawnAgentTool};

use std::sync::Arc;

use super::{ToolExecutor, ToolRegistry};
use crate::agent::SubAgentConfig;
use crate::error::ToolError;
use crate::provider::ChatProvider;
use crate::tasks::BackgroundManager;

/// Registry holding the four built-in tools.
pub fn builtin_registry(
    blocked_patterns: &[(String, String)],
    shell_timeout_secs: u64,
) -> Result<ToolRegistry, ToolError> {
    let mut registry = ToolRegistry::new();
    registry.register(ShellExecTool::new(
        CommandFilter::new(blocked_patterns)?,
        shell_timeout_secs,
    ))?;
    registry.register(FileReadTool)?;
    registry.register(FileWriteTool)?;
    registry.register(ListDirTool)?;
    Ok(registry)
}

/// Tool set for an interactive agent: everything in `base` plus
/// `background` and `spawn_agent`. Sub-agents started through either tool
/// only see `base`.
pub fn agent_registry(
    base: &ToolExecutor,
    provider: Arc<dyn ChatProvider>,
    background: BackgroundManager,
    sub_agents: SubAgentConfig,
) -> Result<ToolRegistry, ToolError> {
    let mut registry = base.registry().clone();
    registry.register(BackgroundTool::new(background))?;
    registry.register(SpawnAgentTool::new(provider, base.clone(), sub_agents))?;
    Ok(registry)
}
