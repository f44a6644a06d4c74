//! Tool registry and the executor that gates dispatch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::permission::PermissionManager;
use super::{Tool, ToolContext, ToolDefinition, ToolResult};
use crate::error::ToolError;
use crate::provider::ToolCall;

/// Maximum characters of raw arguments shown to the approval prompt.
const DETAIL_PREVIEW_CHARS: usize = 200;

/// Named collection of tools. Iteration order is by name so the schema list
/// sent to the model is stable.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<(), ToolError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.definition().name;
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateName(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Registry restricted to `names`. Unknown names are logged and skipped.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> ToolRegistry {
        let mut tools = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            match self.tools.get(name) {
                Some(tool) => {
                    tools.insert(name.to_string(), tool.clone());
                }
                None => tracing::warn!(tool = name, "Requested tool is not registered"),
            }
        }
        ToolRegistry { tools }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

/// Validates, permission-checks and dispatches tool calls.
///
/// Order for every call: lookup, argument parse, schema validation,
/// permission gate, body. Each step that fails produces a failed
/// [`ToolResult`]; the body is only reached when all of them pass.
#[derive(Clone, Debug)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    permissions: Arc<PermissionManager>,
    workspace: PathBuf,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, permissions: Arc<PermissionManager>, workspace: PathBuf) -> Self {
        Self {
            registry,
            permissions,
            workspace,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.permissions
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Executor over a different tool set and permission gate, same workspace.
    pub fn scoped(&self, registry: ToolRegistry, permissions: Arc<PermissionManager>) -> Self {
        Self {
            registry,
            permissions,
            workspace: self.workspace.clone(),
        }
    }

    pub async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let Some(tool) = self.registry.get(&call.name) else {
            return ToolResult::error(format!("Unknown tool: {}", call.name));
        };

        let args = match call.parsed_arguments() {
            Ok(args) => args,
            Err(e) => {
                return ToolResult::error(format!("Invalid JSON arguments for {}: {e}", call.name));
            }
        };

        if let Err(e) = tool.validate(&args) {
            return ToolResult::error(format!("Invalid arguments for {}: {e}", call.name));
        }

        let resource = tool.resource(&args);
        let detail = preview(&call.arguments);
        if let Err(e) = self
            .permissions
            .check(call, &call.name, resource.as_deref(), &detail, cancel)
            .await
        {
            tracing::info!(tool = %call.name, reason = %e, "Tool call not permitted");
            return ToolResult::error(e);
        }

        let ctx = ToolContext::new(self.workspace.clone()).with_cancel(cancel.clone());
        tracing::debug!(tool = %call.name, id = %call.id, "Dispatching tool call");
        tool.execute(args, &ctx).await
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= DETAIL_PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(DETAIL_PREVIEW_CHARS).collect();
    format!("{cut}...")
}
