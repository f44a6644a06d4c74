//! System prompts for the interactive agent and for sub-agents.
//!
//! The interactive prompt wraps an optional operator-provided `TASKER.md`
//! from the workspace with harness context (model, workspace, tools,
//! constraints). Sub-agent prompts are built from the task goal instead.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::ToolDefinition;

/// Operator prompt file looked up in the workspace root.
pub const OPERATOR_PROMPT_FILE: &str = "TASKER.md";

/// Flavour of sub-agent. `Explore` is told not to modify anything; this is
/// a prompt-level instruction, not enforced by the tool gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubAgentKind {
    #[default]
    General,
    Explore,
}

/// Human-readable tool listing embedded in prompts.
pub fn tool_descriptions(tools: &[ToolDefinition]) -> String {
    let mut out = String::new();
    for tool in tools {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!("### {}\n{}", tool.name, tool.description));

        let required: Vec<&str> = tool
            .parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(props) = tool.parameters.get("properties").and_then(Value::as_object) {
            for (name, spec) in props {
                let ty = spec.get("type").and_then(Value::as_str).unwrap_or("any");
                let req = if required.contains(&name.as_str()) {
                    ", required"
                } else {
                    ""
                };
                let desc = spec.get("description").and_then(Value::as_str).unwrap_or("");
                out.push_str(&format!("\n- **{name}** ({ty}{req}): {desc}"));
            }
        }
    }
    out
}

/// Build the interactive agent's system prompt.
///
/// `TASKER.md` in the workspace is appended when present; a missing file is
/// not an error.
pub async fn build_system_prompt(workspace: &Path, model: &str, tools: &[ToolDefinition]) -> String {
    let operator = tokio::fs::read_to_string(workspace.join(OPERATOR_PROMPT_FILE))
        .await
        .ok();
    let workspace_display = workspace.display();
    let tool_list = tool_descriptions(tools);

    let mut prompt = format!(
        "\
You are a coding agent working in a local workspace through tools.

## Environment
- Model: {model}
- Workspace: {workspace_display}
- Shell commands execute in the workspace directory

## Available Tools
{tool_list}

## Constraints
- File writes are restricted to the workspace directory
- Shell commands are filtered against a blocklist and have a timeout
- Some tools require the user's approval before they run
- Call tools one step at a time; later calls may depend on earlier results"
    );

    if let Some(content) = operator.filter(|c| !c.trim().is_empty()) {
        prompt.push_str("\n\n## Operator Instructions\n\n---\n\n");
        prompt.push_str(&content);
    }
    prompt
}

/// Build a goal-directed prompt for a sub-agent.
pub fn build_sub_agent_prompt(
    kind: SubAgentKind,
    goal: &str,
    context: &[(String, String)],
    tools: &[ToolDefinition],
) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(
        "You are a sub-agent running one task on behalf of a parent agent.\n\
         Accomplish the goal below and report your results.\n\n",
    );

    prompt.push_str("## Your Goal\n\n");
    prompt.push_str(goal);
    prompt.push_str("\n\n");

    if !context.is_empty() {
        prompt.push_str("## Context\n\n");
        for (key, value) in context {
            prompt.push_str(&format!("- **{key}**: {value}\n"));
        }
        prompt.push('\n');
    }

    if !tools.is_empty() {
        prompt.push_str("## Available Tools\n\n");
        prompt.push_str(&tool_descriptions(tools));
        prompt.push_str("\n\n");
    }

    match kind {
        SubAgentKind::General => prompt.push_str(
            "## Instructions\n\n\
             1. Work toward the goal using the available tools.\n\
             2. Keep changes inside the workspace.\n\
             3. When finished, reply with a concise summary of what you did and found.\n\
             4. If you hit an error you cannot resolve, explain what went wrong.\n",
        ),
        SubAgentKind::Explore => prompt.push_str(
            "## Instructions\n\n\
             This is a read-only exploration task.\n\
             1. Do NOT create, modify or delete files, and do not run commands with side effects.\n\
             2. Read files, list directories and run inspection commands only.\n\
             3. When finished, reply with your findings, citing file paths.\n",
        ),
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn tools() -> Vec<ToolDefinition> {
        vec![ToolDefinition::new(
            "file_read",
            "Read a file.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string", "description": "File path"}},
                "required": ["path"]
            }),
        )]
    }

    #[test]
    fn tool_descriptions_list_parameters() {
        let text = tool_descriptions(&tools());
        assert!(text.contains("### file_read"));
        assert!(text.contains("- **path** (string, required): File path"));
    }

    #[tokio::test]
    async fn operator_prompt_is_appended_when_present() {
        let tmp = TempDir::new().unwrap();
        let without = build_system_prompt(tmp.path(), "m", &tools()).await;
        assert!(!without.contains("Operator Instructions"));

        std::fs::write(tmp.path().join(OPERATOR_PROMPT_FILE), "Prefer small commits.").unwrap();
        let with = build_system_prompt(tmp.path(), "m", &tools()).await;
        assert!(with.contains("Model: m"));
        assert!(with.ends_with("Prefer small commits."));
    }

    #[test]
    fn sub_agent_prompt_includes_goal_and_context() {
        let context = vec![("language".to_string(), "Rust".to_string())];
        let prompt = build_sub_agent_prompt(SubAgentKind::General, "Fix the build", &context, &tools());
        assert!(prompt.contains("Fix the build"));
        assert!(prompt.contains("- **language**: Rust"));
        assert!(prompt.contains("## Available Tools"));
    }

    #[test]
    fn explore_prompt_forbids_mutation() {
        let prompt = build_sub_agent_prompt(SubAgentKind::Explore, "Map the repo", &[], &[]);
        assert!(prompt.contains("Do NOT create, modify or delete files"));
        assert!(!prompt.contains("## Context"));
    }
}
