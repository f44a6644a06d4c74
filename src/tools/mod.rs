//! Tool framework for the agent loop.
//!
//! Every tool implements [`Tool`]: a static [`ToolDefinition`] the model sees,
//! an argument check against that definition's schema, and an async body.
//! Tool failures are always [`ToolResult`] values with `success: false` so the
//! model can observe the error and react; nothing in this module returns `Err`
//! for an expected failure.

pub mod builtin;
pub mod permission;
pub mod registry;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

pub use permission::{
    AlwaysGrant, LinePrompt, PermissionDecision, PermissionLevel, PermissionManager, PermissionPrompt,
    PermissionScope, PermissionStore, TomlPermissionStore,
};
pub use registry::{ToolExecutor, ToolRegistry};

/// Schema surface a tool exposes to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-Schema-like object: `{type: "object", properties, required}`.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Result of one tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            metadata: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            metadata: None,
        }
    }

    /// Failed result that still carries partial output (e.g. a non-zero exit).
    pub fn failure(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Text appended to the conversation as the tool message.
    pub fn to_message_content(&self) -> String {
        match (&self.error, self.success) {
            (Some(err), false) if self.output.is_empty() => format!("Error: {err}"),
            (Some(err), false) => format!("{}\nError: {err}", self.output),
            _ => self.output.clone(),
        }
    }
}

/// Environment handed to a tool body.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Working directory; writes are confined to it.
    pub workspace: PathBuf,
    /// Cancellation signal of the turn that issued the call.
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Capability interface implemented by every tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Check `args` before the body runs. The default checks required fields
    /// and declared property types against the definition's schema.
    fn validate(&self, args: &Value) -> Result<(), String> {
        validate_arguments(&self.definition().parameters, args)
    }

    /// Resource qualifier for permission lookup (`tool:resource`), if any.
    fn resource(&self, _args: &Value) -> Option<String> {
        None
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult;
}

/// Check an argument object against a `{properties, required}` schema.
///
/// Only the top level is checked: every `required` name must be present and
/// non-null, and every present property with a declared `type` must match it.
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            match obj.get(name) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required argument '{name}'"));
                }
                Some(_) => {}
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in obj {
            let Some(expected) = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if !type_matches(expected, value) {
                return Err(format!(
                    "argument '{name}' must be of type {expected}, got {}",
                    json_type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "limit": {"type": "integer"},
                "recursive": {"type": "boolean"}
            },
            "required": ["path"]
        })
    }

    #[test]
    fn valid_arguments_pass() {
        assert!(validate_arguments(&schema(), &json!({"path": "a", "limit": 3})).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let err = validate_arguments(&schema(), &json!({"limit": 3})).unwrap_err();
        assert!(err.contains("path"), "got: {err}");
    }

    #[test]
    fn null_required_field_fails() {
        assert!(validate_arguments(&schema(), &json!({"path": null})).is_err());
    }

    #[test]
    fn type_mismatch_fails() {
        let err = validate_arguments(&schema(), &json!({"path": "a", "limit": "ten"})).unwrap_err();
        assert!(err.contains("integer"), "got: {err}");
    }

    #[test]
    fn non_object_arguments_fail() {
        assert!(validate_arguments(&schema(), &json!(["a"])).is_err());
    }

    #[test]
    fn unknown_properties_are_ignored() {
        assert!(validate_arguments(&schema(), &json!({"path": "a", "extra": 1})).is_ok());
    }

    #[test]
    fn message_content_includes_error() {
        assert_eq!(ToolResult::error("boom").to_message_content(), "Error: boom");
        assert_eq!(
            ToolResult::failure("partial", "exit 1").to_message_content(),
            "partial\nError: exit 1"
        );
        assert_eq!(ToolResult::success("ok").to_message_content(), "ok");
    }
}
