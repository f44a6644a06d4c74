mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{ScriptedExecutor, ScriptedProvider, runner};
use tasker::agent::SubAgentConfig;
use tasker::provider::{ChatProvider, Message, ToolCall};
use tasker::tasks::{BackgroundManager, TaskStatus};
use tasker::tools::builtin::{agent_registry, builtin_registry, default_blocklist};
use tasker::tools::permission::default_policies;
use tasker::tools::{PermissionLevel, PermissionManager, ToolExecutor, ToolResult};

// ─── Helpers ──────────────────────────────────────────────────────────

struct Harness {
    _workspace: TempDir,
    executor: ToolExecutor,
    background: BackgroundManager,
}

fn all_auto() -> HashMap<String, PermissionLevel> {
    default_policies()
        .into_keys()
        .map(|name| (name, PermissionLevel::Auto))
        .collect()
}

fn harness(
    tasks: ScriptedExecutor,
    provider: Arc<dyn ChatProvider>,
    policies: HashMap<String, PermissionLevel>,
) -> Harness {
    let workspace = tempfile::tempdir().expect("failed to create temp dir");
    let permissions = Arc::new(PermissionManager::new(policies));
    let base = ToolExecutor::new(
        builtin_registry(&default_blocklist(), 5).unwrap(),
        permissions.clone(),
        workspace.path().canonicalize().unwrap(),
    );
    let background = BackgroundManager::new(runner(Arc::new(tasks)), 2);
    let registry = agent_registry(&base, provider, background.clone(), SubAgentConfig::default()).unwrap();
    Harness {
        _workspace: workspace,
        executor: base.scoped(registry, permissions),
        background,
    }
}

async fn call(executor: &ToolExecutor, name: &str, args: Value) -> ToolResult {
    executor
        .execute(&ToolCall::new("t1", name, args.to_string()), &CancellationToken::new())
        .await
}

fn parse(result: &ToolResult) -> Value {
    serde_json::from_str(&result.output).expect("tool output should be JSON")
}

// ============================================================
// background
// ============================================================

#[tokio::test]
async fn test_background_tool_runs_a_task_to_completion() {
    let h = harness(ScriptedExecutor::new(), ScriptedProvider::new(vec![]), all_auto());

    let started = call(
        &h.executor,
        "background",
        json!({"action": "start", "id": "job", "prompt": "summarize the logs"}),
    )
    .await;
    assert!(started.success, "{started:?}");
    assert_eq!(parse(&started)["id"], "job");

    let result = h.background.wait("job").await.unwrap();
    assert_eq!(result.status, TaskStatus::Completed);

    let status = call(&h.executor, "background", json!({"action": "status", "id": "job"})).await;
    assert!(status.success);
    assert_eq!(parse(&status)["progress"]["status"], "completed");

    let output = call(&h.executor, "background", json!({"action": "output", "id": "job"})).await;
    assert_eq!(output.output.trim(), "job done");

    let list = call(&h.executor, "background", json!({"action": "list"})).await;
    assert_eq!(list.metadata.as_ref().unwrap()["count"], 1);
    assert_eq!(parse(&list)[0]["id"], "job");

    let stats = call(&h.executor, "background", json!({"action": "stats"})).await;
    assert_eq!(parse(&stats)["completed"], 1);
}

#[tokio::test]
async fn test_background_tool_cancels_a_running_task() {
    let tasks = ScriptedExecutor::new().slow("slow", Duration::from_secs(60));
    let h = harness(tasks, ScriptedProvider::new(vec![]), all_auto());

    call(
        &h.executor,
        "background",
        json!({"action": "start", "id": "slow", "prompt": "take your time"}),
    )
    .await;
    let cancelled = call(&h.executor, "background", json!({"action": "cancel", "id": "slow"})).await;
    assert!(cancelled.success, "{cancelled:?}");
    assert_eq!(parse(&cancelled)["cancelled"], true);

    let result = tokio::time::timeout(Duration::from_secs(5), h.background.wait("slow"))
        .await
        .expect("cancelled task should finish promptly")
        .unwrap();
    assert_eq!(result.status, TaskStatus::Cancelled);

    let again = call(&h.executor, "background", json!({"action": "cancel", "id": "slow"})).await;
    assert!(!again.success);
    assert!(again.error.unwrap().contains("No pending or running"));
}

#[tokio::test]
async fn test_background_tool_reports_unknown_ids() {
    let h = harness(ScriptedExecutor::new(), ScriptedProvider::new(vec![]), all_auto());

    let result = call(&h.executor, "background", json!({"action": "status", "id": "ghost"})).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Background task not found: ghost"));
}

#[tokio::test]
async fn test_background_start_is_gated_but_reads_are_not() {
    let h = harness(ScriptedExecutor::new(), ScriptedProvider::new(vec![]), default_policies());

    let start = call(
        &h.executor,
        "background",
        json!({"action": "start", "prompt": "anything"}),
    )
    .await;
    assert!(!start.success);
    assert!(start.error.unwrap().contains("requires confirmation"));
    assert_eq!(h.background.stats().total, 0);

    let list = call(&h.executor, "background", json!({"action": "list"})).await;
    assert!(list.success, "{list:?}");
}

#[tokio::test]
async fn test_background_rejects_missing_arguments_before_running() {
    let h = harness(ScriptedExecutor::new(), ScriptedProvider::new(vec![]), all_auto());

    let result = call(&h.executor, "background", json!({"action": "output"})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("requires 'id'"));
}

// ============================================================
// spawn_agent
// ============================================================

#[tokio::test]
async fn test_spawn_agent_returns_the_sub_agent_report() {
    let provider = ScriptedProvider::new(vec![
        Message::assistant_with_tools("", vec![ToolCall::new("c1", "list_dir", "{}")]),
        Message::assistant("The workspace is empty."),
    ]);
    let h = harness(ScriptedExecutor::new(), provider.clone(), all_auto());

    let result = call(
        &h.executor,
        "spawn_agent",
        json!({"prompt": "What is in the workspace?", "kind": "explore"}),
    )
    .await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "The workspace is empty.");
    assert_eq!(result.metadata.as_ref().unwrap()["iterations"], 2);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_spawned_agent_cannot_spawn_again() {
    let provider = ScriptedProvider::new(vec![
        Message::assistant_with_tools(
            "",
            vec![ToolCall::new("c1", "spawn_agent", r#"{"prompt":"go deeper"}"#)],
        ),
        Message::assistant("stayed at one level"),
    ]);
    let h = harness(ScriptedExecutor::new(), provider.clone(), all_auto());

    let result = call(&h.executor, "spawn_agent", json!({"prompt": "delegate"})).await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.output, "stayed at one level");
    // A nested agent would have consumed more replies.
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_spawn_agent_times_out() {
    let provider = ScriptedProvider::repeating(Message::assistant_with_tools(
        "",
        vec![ToolCall::new("c1", "shell_exec", r#"{"command":"sleep 3"}"#)],
    ));
    let h = harness(ScriptedExecutor::new(), provider, all_auto());

    let result = call(
        &h.executor,
        "spawn_agent",
        json!({"prompt": "wait around", "timeout_secs": 1}),
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Sub-agent timed out"));
}

#[tokio::test]
async fn test_spawn_agent_rejects_unknown_kind() {
    let h = harness(ScriptedExecutor::new(), ScriptedProvider::new(vec![]), all_auto());

    let result = call(&h.executor, "spawn_agent", json!({"prompt": "x", "kind": "wizard"})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("unknown kind"));
}
