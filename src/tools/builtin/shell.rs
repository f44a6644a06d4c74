//! `shell_exec`: run a command with `sh -c` inside the workspace.
//!
//! The child runs in its own process group so a timeout can kill the whole
//! tree (`killpg` with SIGKILL) and reap it, leaving no orphans behind.
//! Only that timeout kills: if the caller drops the future (a sub-agent or
//! workflow deadline), the command keeps running and is reaped by tokio.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::guard::CommandFilter;
use crate::tools::{Tool, ToolContext, ToolDefinition, ToolResult};

/// Result of a shell command execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Run `command` via `sh -c` in `cwd`, killing the process group after
/// `timeout_secs`.
pub async fn execute_shell(command: &str, cwd: &Path, timeout_secs: u64) -> std::io::Result<ExecResult> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(out) = stdout.as_mut() {
            let _ = out.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(err) = stderr.as_mut() {
            let _ = err.read_to_end(&mut buf).await;
        }
        buf
    });

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => (status?.code(), false),
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
            if let Some(pid) = child.id() {
                let pgid = nix::unistd::Pid::from_raw(pid as i32);
                let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
            }
            let _ = child.wait().await;
            tracing::warn!(command, timeout_secs, "Shell command timed out");
            (None, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(ExecResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        timed_out,
    })
}

pub struct ShellExecTool {
    filter: CommandFilter,
    timeout_secs: u64,
}

impl ShellExecTool {
    pub fn new(filter: CommandFilter, timeout_secs: u64) -> Self {
        Self {
            filter,
            timeout_secs,
        }
    }
}

#[async_trait]
impl Tool for ShellExecTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "shell_exec",
            "Execute a shell command in the workspace directory. The command runs via \
             `sh -c` with the workspace as the working directory. Returns a JSON object \
             with fields: stdout, stderr, exit_code, timed_out.",
            json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute"
                    }
                },
                "required": ["command"]
            }),
        )
    }

    /// The program name, so `shell_exec:git` style policies apply.
    fn resource(&self, args: &Value) -> Option<String> {
        args.get("command")
            .and_then(Value::as_str)
            .and_then(|c| c.split_whitespace().next())
            .map(str::to_string)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let command = args["command"].as_str().unwrap_or_default();

        if let Some(reason) = self.filter.check(command) {
            tracing::warn!(command, reason, "Blocked shell command");
            return ToolResult::error(format!("Command blocked: {reason}"))
                .with_metadata("blocked", Value::Bool(true));
        }

        let result = match execute_shell(command, &ctx.workspace, self.timeout_secs).await {
            Ok(result) => result,
            Err(e) => return ToolResult::error(format!("shell_exec failed: {e}")),
        };

        let output = serde_json::to_string(&result).unwrap_or_else(|e| {
            json!({"error": format!("Failed to serialize exec result: {e}")}).to_string()
        });
        let exit = result
            .exit_code
            .map_or(Value::Null, |c| Value::Number(c.into()));

        if result.timed_out {
            ToolResult::failure(output, format!("Command timed out after {}s", self.timeout_secs))
        } else if result.exit_code == Some(0) {
            ToolResult::success(output).with_metadata("exit_code", exit)
        } else {
            let code = result
                .exit_code
                .map_or_else(|| "unknown".to_string(), |c| c.to_string());
            ToolResult::failure(output, format!("Command exited with code {code}"))
                .with_metadata("exit_code", exit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::guard::default_blocklist;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn tool() -> ShellExecTool {
        ShellExecTool::new(CommandFilter::new(&default_blocklist()).unwrap(), 5)
    }

    fn ctx(tmp: &TempDir) -> ToolContext {
        ToolContext::new(PathBuf::from(tmp.path()))
    }

    #[tokio::test]
    async fn runs_in_workspace() {
        let tmp = TempDir::new().unwrap();
        let result = tool().execute(json!({"command": "echo hello"}), &ctx(&tmp)).await;
        assert!(result.success);
        let parsed: Value = serde_json::from_str(&result.output).unwrap();
        assert_eq!(parsed["stdout"], "hello\n");
        assert_eq!(parsed["exit_code"], 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_with_output() {
        let tmp = TempDir::new().unwrap();
        let result = tool().execute(json!({"command": "echo out; exit 3"}), &ctx(&tmp)).await;
        assert!(!result.success);
        assert!(result.output.contains("out"));
        assert_eq!(result.error.as_deref(), Some("Command exited with code 3"));
    }

    #[tokio::test]
    async fn blocked_command_never_runs() {
        let tmp = TempDir::new().unwrap();
        let result = tool()
            .execute(json!({"command": "sudo touch marker"}), &ctx(&tmp))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Command blocked"));
        assert!(!tmp.path().join("marker").exists());
    }

    #[tokio::test]
    async fn dropped_call_still_finishes_the_command() {
        let tmp = TempDir::new().unwrap();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            execute_shell("sleep 1; touch marker", tmp.path(), 30),
        )
        .await;
        assert!(abandoned.is_err());

        let marker = tmp.path().join("marker");
        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn own_timeout_kills_the_process_group() {
        let tmp = TempDir::new().unwrap();
        let result = execute_shell("sleep 2; touch marker", tmp.path(), 1).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!tmp.path().join("marker").exists());
    }

    #[test]
    fn resource_is_program_name() {
        assert_eq!(
            tool().resource(&json!({"command": "git status --short"})),
            Some("git".to_string())
        );
    }
}
