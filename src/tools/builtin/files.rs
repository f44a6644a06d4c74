//! Filesystem tools. Reads are unrestricted; writes go through
//! [`WorkspaceGuard`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::guard::WorkspaceGuard;
use crate::tools::{Tool, ToolContext, ToolDefinition, ToolResult};

/// Relative paths resolve against the workspace; absolute paths are kept.
fn resolve(workspace: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workspace.join(p)
    }
}

pub struct FileReadTool;

#[async_trait]
impl Tool for FileReadTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "file_read",
            "Read the contents of a file. The path can be relative to the workspace root \
             or absolute. Read access is unrestricted.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path, relative to workspace or absolute"
                    }
                },
                "required": ["path"]
            }),
        )
    }

    fn resource(&self, args: &Value) -> Option<String> {
        args.get("path").and_then(Value::as_str).map(str::to_string)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let path = args["path"].as_str().unwrap_or_default();
        match tokio::fs::read_to_string(resolve(&ctx.workspace, path)).await {
            Ok(content) => {
                let bytes = content.len();
                ToolResult::success(content).with_metadata("bytes", json!(bytes))
            }
            Err(e) => ToolResult::error(format!("file_read: {e}")),
        }
    }
}

pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "file_write",
            "Write content to a file within the workspace directory. Parent directories \
             are created automatically. Writes outside the workspace are rejected.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path relative to the workspace root"
                    },
                    "content": {
                        "type": "string",
                        "description": "Content to write to the file"
                    }
                },
                "required": ["path", "content"]
            }),
        )
    }

    fn resource(&self, args: &Value) -> Option<String> {
        args.get("path").and_then(Value::as_str).map(str::to_string)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let path = args["path"].as_str().unwrap_or_default();
        let content = args["content"].as_str().unwrap_or_default();

        let guard = match WorkspaceGuard::new(&ctx.workspace) {
            Ok(guard) => guard,
            Err(e) => return ToolResult::error(format!("file_write: {e}")),
        };
        let target = match guard.resolve_write(path) {
            Ok(target) => target,
            Err(e) => return ToolResult::error(format!("file_write: {e}")),
        };

        match tokio::fs::write(&target, content).await {
            Ok(()) => ToolResult::success(
                json!({"written_bytes": content.len(), "path": path}).to_string(),
            ),
            Err(e) => ToolResult::error(format!("file_write: {e}")),
        }
    }
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "list_dir",
            "List the entries of a directory, sorted by name. Directories end with '/'.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory path, defaults to the workspace root"
                    }
                }
            }),
        )
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let dir = resolve(&ctx.workspace, path);

        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) => return ToolResult::error(format!("list_dir: {e}")),
        };

        let mut entries = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                        name.push('/');
                    }
                    entries.push(name);
                }
                Ok(None) => break,
                Err(e) => return ToolResult::error(format!("list_dir: {e}")),
            }
        }
        entries.sort();

        let count = entries.len();
        ToolResult::success(entries.join("\n")).with_metadata("entries", json!(count))
    }
}
