use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::tools::PermissionLevel;

/// The TOML file structure for tasker.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub provider: Option<ProviderSection>,
    pub agent: Option<AgentSection>,
    pub tasks: Option<TasksSection>,
    pub safety: Option<SafetySection>,
    /// `tool` or `tool:resource` -> level.
    pub permissions: Option<HashMap<String, PermissionLevel>>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderSection {
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_base_ms: Option<u64>,
    pub retry_max_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AgentSection {
    pub max_iterations: Option<u32>,
    pub compaction_threshold: Option<usize>,
    pub preserve_recent: Option<usize>,
    pub sub_agent_timeout_secs: Option<u64>,
    pub sub_agent_max_iterations: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TasksSection {
    pub max_concurrent: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SafetySection {
    pub shell_timeout_secs: Option<u64>,
    /// If specified, fully replaces the default blocklist.
    pub blocked_patterns: Option<Vec<BlocklistEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlocklistEntry {
    pub pattern: String,
    pub reason: String,
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub workspace: PathBuf,

    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub request_timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,

    pub max_iterations: u32,
    pub compaction_threshold: usize,
    pub preserve_recent: usize,
    pub sub_agent_timeout_secs: u64,
    pub sub_agent_max_iterations: u32,

    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub task_max_retries: u32,
    pub task_retry_delay_ms: u64,

    pub shell_timeout_secs: u64,
    pub blocked_patterns: Vec<(String, String)>,

    pub permissions: HashMap<String, PermissionLevel>,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub workspace: Option<PathBuf>,

    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_base_ms: Option<u64>,
    pub retry_max_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,

    pub max_iterations: Option<u32>,
    pub compaction_threshold: Option<usize>,
    pub preserve_recent: Option<usize>,
    pub sub_agent_timeout_secs: Option<u64>,
    pub sub_agent_max_iterations: Option<u32>,

    pub max_concurrent: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub task_max_retries: Option<u32>,
    pub task_retry_delay_ms: Option<u64>,

    pub shell_timeout_secs: Option<u64>,
    pub blocked_patterns: Option<Vec<(String, String)>>,

    pub permissions: Option<HashMap<String, PermissionLevel>>,
}
